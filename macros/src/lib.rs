//! Augment ring simulation tests with procedural macros.

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, Ident, ItemFn, LitStr, Token,
};

/// Level accepted by `#[test_traced]`, either bare (`"DEBUG"`) or named (`level = "DEBUG"`).
struct Level(Option<LitStr>);

impl Parse for Level {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self(None));
        }
        if input.peek(LitStr) {
            return Ok(Self(Some(input.parse()?)));
        }
        let name: Ident = input.parse()?;
        if name != "level" {
            return Err(syn::Error::new(name.span(), "expected `level`"));
        }
        input.parse::<Token![=]>()?;
        Ok(Self(Some(input.parse()?)))
    }
}

/// Run a test with a `tracing_subscriber` fmt subscriber installed for its duration.
///
/// The subscriber captures output through the test harness so logs only appear when the
/// test fails (or when run with `--nocapture`). The default level is `DEBUG`.
///
/// # Example
///
/// ```ignore
/// use ringsim_macros::test_traced;
///
/// #[test_traced("TRACE")]
/// fn test_scheduler() {
///     tracing::trace!("visible on failure");
/// }
/// ```
///
/// Crates using this attribute must have `tracing` and `tracing-subscriber` available
/// (typically as dev-dependencies).
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let level = parse_macro_input!(attr as Level);
    let input = parse_macro_input!(item as ItemFn);

    let level = match level.0 {
        Some(level) => level.value().to_uppercase(),
        None => "DEBUG".to_string(),
    };
    let level = match level.as_str() {
        "TRACE" => quote!(::tracing::Level::TRACE),
        "DEBUG" => quote!(::tracing::Level::DEBUG),
        "INFO" => quote!(::tracing::Level::INFO),
        "WARN" => quote!(::tracing::Level::WARN),
        "ERROR" => quote!(::tracing::Level::ERROR),
        other => {
            return syn::Error::new(
                proc_macro2::Span::call_site(),
                format!("invalid level: {other}"),
            )
            .to_compile_error()
            .into()
        }
    };

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let body = &input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let subscriber = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(#level)
                .with_line_number(true)
                .finish();
            ::tracing::subscriber::with_default(subscriber, || #body)
        }
    };
    TokenStream::from(expanded)
}
