//! Test attributes that fail a test instead of letting it hang forever.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` wraps an
//! async one in a current-thread runtime. Both accept an optional budget:
//! a bare integer (seconds), `secs = N` or `ms = N`. The default is 60s.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

struct Budget {
    millis: u64,
}

impl Parse for Budget {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Budget {
                millis: DEFAULT_TIMEOUT_MS,
            });
        }

        let millis = if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            lit.base10_parse::<u64>()?.saturating_mul(1_000)
        } else {
            let unit: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            let lit: LitInt = input.parse()?;
            let value = lit.base10_parse::<u64>()?;
            match unit.to_string().as_str() {
                "secs" => value.saturating_mul(1_000),
                "ms" => value,
                _ => {
                    return Err(syn::Error::new_spanned(
                        unit,
                        "expected `secs = N` or `ms = N`",
                    ))
                }
            }
        };

        if millis == 0 {
            return Err(input.error("timeout must be greater than zero"));
        }
        Ok(Budget { millis })
    }
}

/// Runs the body on a watchdog thread and converts a missed deadline into a
/// test failure. The body must already be a synchronous expression.
fn guard(millis: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_millis(#millis);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", timeout_duration)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn path_is(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments == expected
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let budget = parse_macro_input!(attr as Budget);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

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
        .filter(|attr| !path_is(attr, &["tokio", "test"]))
        .collect();

    let millis = budget.millis;
    let body = guard(
        millis,
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
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
    let budget = parse_macro_input!(attr as Budget);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !path_is(attr, &["test"]))
        .collect();

    let body = guard(budget.millis, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}
