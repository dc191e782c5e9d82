use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Test attribute that installs the crate's tracing subscriber and runs the
/// body inside a `test` span carrying the test's full path.
///
/// Async tests become `#[tokio::test]`, with any arguments forwarded to it.
/// Sync tests become `#[test]` and take no arguments.
///
/// ```ignore
/// #[lease_lock::test(start_paused = true)]
/// async fn renews_until_stopped() { ... }
///
/// #[lease_lock::test]
/// fn parses_config() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let runtime_args = proc_macro2::TokenStream::from(attr);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);
    let name = &sig.ident;
    let test_path = quote! { concat!(module_path!(), "::", stringify!(#name)) };

    let output = if sig.asyncness.is_some() {
        let tokio_args = (!runtime_args.is_empty()).then(|| quote! { ( #runtime_args ) });
        quote! {
            #[tokio::test #tokio_args]
            #(#attrs)*
            #vis #sig {
                ::lease_lock::trace::with_test_tracing(#test_path, || async move #block).await
            }
        }
    } else if !runtime_args.is_empty() {
        syn::Error::new_spanned(
            runtime_args,
            "arguments to #[lease_lock::test] are runtime options and need an async fn",
        )
        .to_compile_error()
    } else {
        quote! {
            #[test]
            #(#attrs)*
            #vis #sig {
                ::lease_lock::trace::with_test_tracing_sync(#test_path, || #block)
            }
        }
    };
    output.into()
}
