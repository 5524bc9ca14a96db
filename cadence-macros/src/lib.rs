use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Expr, ExprLit, ItemFn, Lit, Meta, Token};

/// `#[cadence::test]`: run a test with tracing installed and the body inside
/// a span named after the test.
///
/// Async tests run on `#[tokio::test]`; every argument except `timeout_ms` is
/// forwarded to it. `timeout_ms = N` fails an async test that runs longer
/// than `N` milliseconds.
///
/// ```ignore
/// #[cadence::test]
/// fn parses() { ... }
///
/// #[cadence::test(flavor = "multi_thread", worker_threads = 4, timeout_ms = 5000)]
/// async fn delivers() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Meta, Token![,]>::parse_terminated);
    let input = parse_macro_input!(item as ItemFn);

    let mut timeout_ms: Option<u64> = None;
    let mut forwarded = Vec::new();
    for meta in args {
        match &meta {
            Meta::NameValue(nv) if nv.path.is_ident("timeout_ms") => match &nv.value {
                Expr::Lit(ExprLit {
                    lit: Lit::Int(n), ..
                }) => match n.base10_parse::<u64>() {
                    Ok(ms) => timeout_ms = Some(ms),
                    Err(e) => return e.to_compile_error().into(),
                },
                other => {
                    return syn::Error::new_spanned(other, "timeout_ms must be an integer literal")
                        .to_compile_error()
                        .into();
                }
            },
            _ => forwarded.push(meta),
        }
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;
    let name = &sig.ident;

    if sig.asyncness.is_none() {
        if timeout_ms.is_some() || !forwarded.is_empty() {
            return syn::Error::new_spanned(
                &sig,
                "arguments are only supported on async tests",
            )
            .to_compile_error()
            .into();
        }
        return quote! {
            #[test]
            #(#attrs)*
            #vis #sig {
                cadence::trace::with_test_tracing_sync(stringify!(#name), || #block)
            }
        }
        .into();
    }

    let tokio_args = if forwarded.is_empty() {
        quote! {}
    } else {
        quote! { ( #(#forwarded),* ) }
    };
    let body = match timeout_ms {
        Some(ms) => quote! {
            tokio::time::timeout(
                std::time::Duration::from_millis(#ms),
                cadence::trace::with_test_tracing(stringify!(#name), || async move #block),
            )
            .await
            .expect(concat!(stringify!(#name), " timed out"))
        },
        None => quote! {
            cadence::trace::with_test_tracing(stringify!(#name), || async move #block).await
        },
    };

    quote! {
        #[tokio::test #tokio_args]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}
