//! Test attributes that fail a test once it runs past a wall-clock limit.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one on a fresh
//! current-thread runtime. Both take an optional limit in seconds
//! (`#[test_timeout::timeout(5)]`); the default is 60.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_LIMIT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match limit_secs(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "use tokio_timeout_test for async test functions",
        )
        .to_compile_error()
        .into();
    }

    let attrs = retain_foreign(attrs, &[&["test"]]);
    let body = quote! { #block };
    expand(attrs, vis, sig, limit, body)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match limit_secs(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test expects an async test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = retain_foreign(attrs, &[&["test"], &["tokio", "test"]]);
    let body = quote! {{
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async move {
            tokio::time::timeout(__limit, async move #block)
                .await
                .expect("test timed out")
        })
    }};
    expand(attrs, vis, sig, limit, body)
}

fn limit_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_LIMIT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Drop attributes the generated function re-emits itself.
fn retain_foreign(attrs: Vec<Attribute>, owned: &[&[&str]]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let path: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !owned.iter().any(|candidate| path == *candidate)
        })
        .collect()
}

/// Run `body` on a watchdog thread and fail the test if it has not reported
/// back within `limit` seconds.
fn expand(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    limit: u64,
    body: TokenStream2,
) -> TokenStream {
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __limit = std::time::Duration::from_secs(#limit);
            let (__tx, __rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = __tx.send(outcome);
            });
            match __rx.recv_timeout(__limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}
