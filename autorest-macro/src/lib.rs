//! # AutoREST Procedural Macros
//!
//! This crate provides the `#[api]` attribute macro for the AutoREST
//! library.
//!
//! ## `#[api]` Macro
//!
//! The `#[api]` macro turns a plain trait into a REST contract. It generates:
//! - A `rest_export` method that registers every endpoint with a server
//! - A `{Trait}Client` proxy type that speaks the same wire contract
//! - Parameter binding code shared bit-for-bit by both halves
//!
//! ### Example
//!
//! ```rust,ignore
//! #[autorest::api("api/sample")]
//! pub trait SampleApi {
//!     async fn to_upper(&self, value: String) -> Result<String>;
//!
//!     #[rest(verb = "POST")]
//!     async fn send_lots_of_data(&self, #[body] data: String) -> Result<()>;
//!
//!     fn simple_event(&self) -> &ServerSideEvent<()>;
//! }
//! ```
//!
//! ### Trait arguments
//!
//! The first argument is the base route. Optional `header("Name", "value")`
//! arguments add response headers to every method endpoint.
//!
//! ### Method attributes
//!
//! - `#[rest(verb = "POST")]` — HTTP verb, default GET
//! - `#[rest(header("Name", "value"))]` — method response header, wins over
//!   a trait-level header with the same name
//! - `#[rest(ignore)]` — keep the method on the trait, expose no endpoint
//!
//! ### Parameter attributes
//!
//! - `#[body]` — bind this parameter from the request body (at most one)
//! - `#[default(expr)]` — value used when the query parameter is absent
//!
//! ### Supported items
//!
//! Methods must be `async fn m(&self, ...) -> Result<T>`. Event properties
//! are plain accessors `fn p(&self) -> &ServerSideEvent<T>`; they get a
//! `{route}/subscribe` + `{route}/unsubscribe` endpoint pair and a relay
//! subscription on the server, and a lazily connected local bus on the
//! client.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    Expr, FnArg, Ident, ItemTrait, LitStr, ReturnType, Token, TraitItem, Type,
    parenthesized,
    parse::{Parse, ParseStream},
    parse_macro_input,
};

/// Trait-level arguments: the base route plus optional shared response
/// headers.
struct ApiArgs {
    base: String,
    headers: Vec<(String, String)>,
}

impl Parse for ApiArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let base: LitStr = input.parse()?;
        let mut headers = Vec::new();
        while !input.is_empty() {
            input.parse::<Token![,]>()?;
            if input.is_empty() {
                break;
            }
            let ident: Ident = input.parse()?;
            if ident != "header" {
                return Err(syn::Error::new(
                    ident.span(),
                    "expected `header(\"Name\", \"value\")`",
                ));
            }
            let content;
            parenthesized!(content in input);
            let name: LitStr = content.parse()?;
            content.parse::<Token![,]>()?;
            let value: LitStr = content.parse()?;
            headers.push((name.value(), value.value()));
        }
        Ok(Self {
            base: normalize_base(&base.value()),
            headers,
        })
    }
}

/// Parsed `#[rest(...)]` method attributes.
#[derive(Default)]
struct RestArgs {
    verb: Option<String>,
    ignore: bool,
    headers: Vec<(String, String)>,
}

/// Procedural macro turning a trait into a REST contract.
///
/// # Panics
///
/// Panics at compile time if:
/// - a method is named `rest_export` (reserved name)
/// - a method is neither `async fn m(&self, ...) -> Result<T>` nor an event
///   accessor `fn p(&self) -> &ServerSideEvent<T>`
/// - a method declares more than one `#[body]` parameter
/// - a `#[rest(verb = "...")]` value is not one of the nine HTTP verbs
#[proc_macro_attribute]
pub fn api(attr: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as ApiArgs);
    let mut input = parse_macro_input!(input as ItemTrait);

    let trait_ident = input.ident.clone();
    let visibility = input.vis.clone();
    let client_ident = format_ident!("{trait_ident}Client");
    let krate = get_crate_name();
    let base = &args.base;

    let mut export_stmts = vec![];
    let mut client_items = vec![];
    let mut event_fields = vec![];
    let mut event_inits = vec![];

    for item in &mut input.items {
        let TraitItem::Fn(method) = item else {
            panic!("`#[api]` traits may only contain methods and event accessors");
        };
        let method_ident = method.sig.ident.clone();
        if method_ident == "rest_export" {
            panic!("the function cannot be named `rest_export`!");
        }
        let rest = take_rest_args(&mut method.attrs);
        if rest.ignore {
            continue;
        }

        if method.sig.asyncness.is_none() {
            // event accessor: fn p(&self) -> &ServerSideEvent<T>
            let Some(payload) = event_payload(&method.sig.output) else {
                panic!(
                    "the function should be `async fn m(&self, ...) -> Result<T>` or an event accessor `fn p(&self) -> &ServerSideEvent<T>`."
                );
            };
            let segment = route_segment(&method_ident);
            let route = format!("{base}/{segment}");
            let sub_route = format!("{route}/subscribe");
            let unsub_route = format!("{route}/unsubscribe");
            let event_name = pascal_case(&method_ident);
            let sig = method.sig.clone();

            export_stmts.push(quote! {
                {
                    let bus = self.#method_ident();
                    bus.attach(service, #event_name);
                    bus.subscribe_relay(server.relay_handler());
                    endpoints.push(#krate::Endpoint::event_subscribe(service, #sub_route));
                    endpoints.push(#krate::Endpoint::event_unsubscribe(service, #unsub_route));
                }
            });
            event_fields.push(quote! {
                #method_ident: ::std::sync::OnceLock<#krate::ServerSideEvent<#payload>>,
            });
            event_inits.push(quote! {
                #method_ident: ::std::sync::OnceLock::new(),
            });
            client_items.push(quote! {
                #sig {
                    self.#method_ident.get_or_init(|| {
                        #krate::EventConnector::connect(&self.connector, &self.host, #route, #event_name)
                    })
                }
            });
            continue;
        }

        // regular method: async fn m(&self, ...) -> Result<T>
        let Some(syn::Receiver {
            reference: Some(_), ..
        }) = method.sig.receiver()
        else {
            panic!("the function should take `&self`.");
        };
        let ReturnType::Type(_, rsp_type) = &method.sig.output else {
            panic!("the function should return `Result<T>`.");
        };
        let Some(inner) = result_inner(rsp_type) else {
            panic!("the function should return `Result<T>`.");
        };
        let return_kind = classify_return(&inner);

        let verb = verb_tokens(rest.verb.as_deref().unwrap_or("GET"), &krate);
        let route = format!("{base}/{}", route_segment(&method_ident));
        let headers = merge_headers(&args.headers, &rest.headers);
        let header_names = headers.iter().map(|(n, _)| n);
        let header_values = headers.iter().map(|(_, v)| v);

        let mut bind_stmts = vec![];
        let mut arg_idents = vec![];
        let mut call_builders = vec![];
        let mut saw_body = false;
        for arg in method.sig.inputs.iter_mut().skip(1) {
            let FnArg::Typed(param) = arg else {
                panic!("the function should take `&self` first.");
            };
            let syn::Pat::Ident(pat) = param.pat.as_ref() else {
                panic!("parameters must be plain identifiers.");
            };
            let ident = pat.ident.clone();
            let name = ident.to_string();
            let ty = param.ty.clone();
            let (is_body, default) = take_param_args(&mut param.attrs);

            if is_body {
                if saw_body {
                    panic!("at most one parameter may be marked `#[body]`.");
                }
                saw_body = true;
                bind_stmts.push(quote! {
                    let #ident: #ty = req.body_json()?;
                });
                call_builders.push(quote! {
                    let call = call.with_body(#krate::serde_json::to_value(&#ident)?);
                });
            } else {
                match default {
                    Some(expr) => bind_stmts.push(quote! {
                        let #ident: #ty = match req.query_param_opt(#name)? {
                            ::std::option::Option::Some(v) => v,
                            ::std::option::Option::None => #expr,
                        };
                    }),
                    None => bind_stmts.push(quote! {
                        let #ident: #ty = req.query_param(#name)?;
                    }),
                }
                call_builders.push(quote! {
                    let call = call.with_param(#name, #krate::serde_json::to_value(&#ident)?);
                });
            }
            arg_idents.push(ident);
        }

        export_stmts.push(quote! {
            {
                let this = ::std::sync::Arc::clone(&self);
                let handler: #krate::MethodHandler =
                    ::std::sync::Arc::new(move |req: #krate::ApiRequest| {
                        let this = ::std::sync::Arc::clone(&this);
                        ::std::boxed::Box::pin(async move {
                            #(#bind_stmts)*
                            let rsp = this.#method_ident(#(#arg_idents),*).await?;
                            #krate::serde_json::to_value(&rsp).map_err(#krate::Error::from)
                        })
                    });
                endpoints.push(#krate::Endpoint::method(
                    service,
                    #route,
                    #verb,
                    ::std::vec![#((#header_names.to_string(), #header_values.to_string())),*],
                    handler,
                ));
            }
        });

        let sig = method.sig.clone();
        let decode = match return_kind {
            ReturnKindTok::Unit => quote! {
                let _ = rsp;
                ::std::result::Result::Ok(())
            },
            ReturnKindTok::Dynamic => quote! { ::std::result::Result::Ok(rsp) },
            ReturnKindTok::Typed => quote! {
                #krate::serde_json::from_value(rsp).map_err(#krate::Error::from)
            },
        };
        let kind = match return_kind {
            ReturnKindTok::Unit => quote! { #krate::ReturnKind::Unit },
            ReturnKindTok::Dynamic => quote! { #krate::ReturnKind::Dynamic },
            ReturnKindTok::Typed => quote! { #krate::ReturnKind::Typed },
        };
        client_items.push(quote! {
            #sig {
                let call = #krate::ApiCall::new(self.host.clone(), #verb, #route, #kind);
                #(#call_builders)*
                let rsp = #krate::CallTransport::call(&*self.transport, &call).await?;
                #decode
            }
        });
    }

    let input_items = &input.items;
    quote! {
        #[#krate::async_trait]
        #visibility trait #trait_ident {
            #(#input_items)*

            /// Registers every endpoint of this instance with the server.
            fn rest_export(self: ::std::sync::Arc<Self>, server: &#krate::RestApiServer)
            where
                Self: ::std::marker::Sized + ::std::marker::Send + ::std::marker::Sync + 'static,
            {
                let service = #krate::ServiceId::of(&self);
                let mut endpoints = ::std::vec::Vec::new();
                #(#export_stmts)*
                server.register_endpoints(endpoints);
            }
        }

        /// Generated proxy speaking the same wire contract as the trait.
        #visibility struct #client_ident<E: #krate::EventConnector = #krate::SseEventConnector> {
            host: ::std::string::String,
            transport: ::std::sync::Arc<dyn #krate::CallTransport>,
            connector: E,
            #(#event_fields)*
        }

        impl #client_ident {
            /// Proxy over the default HTTP transport and event connector.
            #visibility fn implement(host: impl ::std::convert::Into<::std::string::String>) -> Self {
                Self::with_parts(
                    host,
                    ::std::sync::Arc::new(#krate::HttpCallTransport::default()),
                    #krate::SseEventConnector,
                )
            }
        }

        impl<E: #krate::EventConnector> #client_ident<E> {
            #visibility fn with_parts(
                host: impl ::std::convert::Into<::std::string::String>,
                transport: ::std::sync::Arc<dyn #krate::CallTransport>,
                connector: E,
            ) -> Self {
                Self {
                    host: host.into(),
                    transport,
                    connector,
                    #(#event_inits)*
                }
            }
        }

        #[#krate::async_trait]
        impl<E: #krate::EventConnector + 'static> #trait_ident for #client_ident<E> {
            #(#client_items)*
        }
    }
    .into()
}

enum ReturnKindTok {
    Unit,
    Dynamic,
    Typed,
}

/// Extracts and removes the `#[rest(...)]` attributes of a method.
fn take_rest_args(attrs: &mut Vec<syn::Attribute>) -> RestArgs {
    let mut args = RestArgs::default();
    attrs.retain(|attr| {
        if !attr.path().is_ident("rest") {
            return true;
        }
        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("verb") {
                let value: LitStr = meta.value()?.parse()?;
                args.verb = Some(value.value());
                Ok(())
            } else if meta.path.is_ident("ignore") {
                args.ignore = true;
                Ok(())
            } else if meta.path.is_ident("header") {
                let content;
                parenthesized!(content in meta.input);
                let name: LitStr = content.parse()?;
                content.parse::<Token![,]>()?;
                let value: LitStr = content.parse()?;
                args.headers.push((name.value(), value.value()));
                Ok(())
            } else {
                Err(meta.error("expected `verb`, `ignore` or `header`"))
            }
        });
        if let Err(e) = result {
            panic!("invalid #[rest(...)] attribute: {e}");
        }
        false
    });
    args
}

/// Extracts and removes the `#[body]` / `#[default(expr)]` attributes of a
/// parameter.
fn take_param_args(attrs: &mut Vec<syn::Attribute>) -> (bool, Option<Expr>) {
    let mut is_body = false;
    let mut default = None;
    attrs.retain(|attr| {
        if attr.path().is_ident("body") {
            is_body = true;
            false
        } else if attr.path().is_ident("default") {
            match attr.parse_args::<Expr>() {
                Ok(expr) => default = Some(expr),
                Err(e) => panic!("invalid #[default(...)] attribute: {e}"),
            }
            false
        } else {
            true
        }
    });
    (is_body, default)
}

/// The payload type of an event accessor `fn p(&self) -> &ServerSideEvent<T>`,
/// or `None` when the signature is not one.
fn event_payload(output: &ReturnType) -> Option<proc_macro2::TokenStream> {
    let ReturnType::Type(_, ty) = output else {
        return None;
    };
    let Type::Reference(reference) = ty.as_ref() else {
        return None;
    };
    let Type::Path(path) = reference.elem.as_ref() else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "ServerSideEvent" {
        return None;
    }
    match &segment.arguments {
        syn::PathArguments::None => Some(quote! { () }),
        syn::PathArguments::AngleBracketed(args) => {
            let arg = args.args.first()?;
            Some(quote! { #arg })
        }
        syn::PathArguments::Parenthesized(_) => None,
    }
}

/// The `T` of a `Result<T>` return type.
fn result_inner(ty: &Type) -> Option<Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    let syn::PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        syn::GenericArgument::Type(inner) => Some(inner.clone()),
        _ => None,
    }
}

/// Unit / Dynamic / Typed classification of a return type. `Value` returns
/// are passed through undecoded, mirroring the dynamic-data escape hatch.
fn classify_return(inner: &Type) -> ReturnKindTok {
    let text = quote!(#inner).to_string().replace(' ', "");
    if text == "()" {
        ReturnKindTok::Unit
    } else if text == "Value" || text.ends_with("::Value") {
        ReturnKindTok::Dynamic
    } else {
        ReturnKindTok::Typed
    }
}

fn verb_tokens(verb: &str, krate: &proc_macro2::TokenStream) -> proc_macro2::TokenStream {
    let variant = match verb {
        "HEAD" => "Head",
        "GET" => "Get",
        "POST" => "Post",
        "PUT" => "Put",
        "DELETE" => "Delete",
        "CONNECT" => "Connect",
        "OPTIONS" => "Options",
        "TRACE" => "Trace",
        "PATCH" => "Patch",
        other => panic!("unsupported HTTP verb: {other}"),
    };
    let ident = Ident::new(variant, proc_macro2::Span::call_site());
    quote! { #krate::HttpVerb::#ident }
}

/// Trait-level headers first, method-level headers second; a method header
/// replaces a trait header with the same name.
fn merge_headers(
    trait_headers: &[(String, String)],
    method_headers: &[(String, String)],
) -> Vec<(String, String)> {
    let mut merged = trait_headers.to_vec();
    for (name, value) in method_headers {
        merged.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        merged.push((name.clone(), value.clone()));
    }
    merged
}

/// Route segment of a member: underscores stripped, lowercased.
fn route_segment(ident: &Ident) -> String {
    ident.to_string().replace('_', "").to_lowercase()
}

/// Wire display name of an event: PascalCase of the identifier.
fn pascal_case(ident: &Ident) -> String {
    ident
        .to_string()
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Base routes always begin with `/` and never end with one.
fn normalize_base(base: &str) -> String {
    let trimmed = base.trim_matches('/');
    format!("/{trimmed}")
}

/// Gets the correct crate name for importing autorest.
///
/// This function handles both cases:
/// - When autorest-macro is used as a dependency (uses `::autorest`)
/// - When autorest-macro is in the same workspace (uses `crate`)
fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("autorest") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        _ => quote! { crate },
    }
}
