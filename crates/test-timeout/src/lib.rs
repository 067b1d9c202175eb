//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test;
//! `#[test_timeout::tokio_timeout_test]` runs an async test on a fresh
//! current-thread runtime. Both accept an optional timeout in seconds
//! (default 60). The async form also accepts `paused`, which starts the
//! runtime with a paused clock so timer-driven code runs in virtual time
//! (the consuming crate needs tokio's `test-util` feature):
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(5, paused)]
//! async fn gives_up_after_two_seconds() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutOptions {
    secs: u64,
    paused: bool,
}

fn parse_options(attr: TokenStream, allow_paused: bool) -> syn::Result<TimeoutOptions> {
    let mut options = TimeoutOptions {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                options.secs = secs;
            }
            Expr::Path(ExprPath { path, .. }) if allow_paused && path.is_ident("paused") => {
                options.paused = true;
            }
            other => {
                let expected = if allow_paused {
                    "expected a timeout in seconds or `paused`"
                } else {
                    "expected a timeout in seconds"
                };
                return Err(syn::Error::new_spanned(other, expected));
            }
        }
    }
    Ok(options)
}

/// Runs the test body on its own thread and fails once the wall-clock
/// budget is spent, even if the body never yields.
fn guarded_body(secs: u64, run: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #run }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let secs = options.secs;
    let clock = if options.paused {
        quote! { .start_paused(true) }
    } else {
        quote! {}
    };
    let body = guarded_body(
        secs,
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                #clock
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                    .await
                    .expect("test timed out");
            });
        },
    );

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let body = guarded_body(options.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

/// `#[test]` and `#[tokio::test]` are dropped; the expansion adds its own.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
