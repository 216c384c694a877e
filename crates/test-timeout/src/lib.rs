//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[tokio_timeout_test]` runs an async test on a fresh Tokio runtime;
//! `#[timeout]` wraps a synchronous one. Both accept either a bare number of
//! seconds (`#[timeout(5)]`) or named arguments
//! (`#[tokio_timeout_test(secs = 5, flavor = "multi_thread")]`).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::{Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Args {
    secs: u64,
    flavor: Flavor,
}

impl Args {
    fn parse(attr: TokenStream) -> syn::Result<Self> {
        let mut args = Args {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
        };
        if attr.is_empty() {
            return Ok(args);
        }
        if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
            args.secs = parse_secs(&lit)?;
            return Ok(args);
        }

        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("secs") {
                args.secs = parse_secs(&meta.value()?.parse::<LitInt>()?)?;
                Ok(())
            } else if meta.path.is_ident("flavor") {
                let lit: LitStr = meta.value()?.parse()?;
                args.flavor = match lit.value().as_str() {
                    "current_thread" => Flavor::CurrentThread,
                    "multi_thread" => Flavor::MultiThread,
                    other => {
                        return Err(syn::Error::new_spanned(
                            &lit,
                            format!("unknown runtime flavor `{other}`"),
                        ))
                    }
                };
                Ok(())
            } else {
                Err(meta.error("expected `secs` or `flavor`"))
            }
        });
        parser.parse(attr)?;
        Ok(args)
    }
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match Args::parse(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut function = syn::parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    function.sig.asyncness = None;

    let secs = args.secs;
    let builder = match args.flavor {
        Flavor::CurrentThread => quote!(tokio::runtime::Builder::new_current_thread()),
        Flavor::MultiThread => quote!(tokio::runtime::Builder::new_multi_thread()),
    };
    let block = &function.block;
    let body = quote! {
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                .await
                .expect("test timed out");
        });
    };
    expand(function, secs, body, is_tokio_test_attribute)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match Args::parse(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    if args.flavor != Flavor::CurrentThread {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "`flavor` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    let function = syn::parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let block = &function.block;
    let body = quote!(#block;);
    expand(function, args.secs, body, is_test_attribute)
}

// Runs `body` on a watchdog-supervised thread so a hang fails the test even
// when the body never yields.
fn expand(
    function: ItemFn,
    secs: u64,
    body: TokenStream2,
    drop_attr: fn(&Attribute) -> bool,
) -> TokenStream {
    let ItemFn { attrs, vis, sig, .. } = function;
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|attr| !drop_attr(attr)).collect();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(outcome);
            });
            match receiver.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {}s", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
