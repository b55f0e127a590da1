//! Metadata extraction: normalizes a handler description into [`ChainMetadata`].
//!
//! Extraction is pure. Group-level and method-level annotations both
//! contribute; the method level wins where a single value is needed
//! (route, content types) and conflicting explicit declarations fail
//! compilation instead of being resolved silently.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use courier_core::{TypeRef, JSON_CONTENT_TYPE};
use http::Method;
use regex::Regex;

use super::descriptor::{Annotation, HandlerDescriptor, Parameter, ReturnType};
use crate::error::CompilationError;

const GROUP: &str = "group";
const METHOD: &str = "method";

/// Status codes every chain documents even when the handler declares nothing.
const BASELINE_FAILURES: [u16; 2] = [400, 404];

static ROUTE_PARAMETER: LazyLock<Regex> = LazyLock::new(|| {
    // `{name}` or `{name:constraint}`
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(?::[^}]*)?\}").expect("valid route parameter pattern")
});

/// The request body a chain accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptsMetadata {
    pub request_type: TypeRef,
    pub content_types: Vec<String>,
}

/// One documented response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducesMetadata {
    pub status: u16,
    pub body: Option<TypeRef>,
    pub content_types: Vec<String>,
}

/// Route the chain is exposed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub method: Method,
    pub pattern: String,
    pub parameters: Vec<String>,
}

/// Aggregated authorization requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationRequirement {
    pub required: bool,
    pub policies: BTreeSet<String>,
}

/// Normalized description of a chain's cross-cutting behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainMetadata {
    pub content_types: Vec<String>,
    pub request_type: Option<TypeRef>,
    pub resource_type: Option<TypeRef>,
    pub accepts: Option<AcceptsMetadata>,
    pub produces: Vec<ProducesMetadata>,
    pub route: Option<RouteInfo>,
    pub authorization: AuthorizationRequirement,
    pub requires_outbox: bool,
}

impl ChainMetadata {
    /// The documented response for a status code.
    #[must_use]
    pub fn produces_for(&self, status: u16) -> Option<&ProducesMetadata> {
        self.produces.iter().find(|p| p.status == status)
    }

    /// Status answered when the terminal handler completes normally.
    #[must_use]
    pub fn success_status(&self) -> u16 {
        if self.resource_type.is_some() {
            200
        } else {
            204
        }
    }
}

/// Resource type of a return shape: wrappers are unwrapped one layer at a time
/// and no-value shapes resolve to none.
#[must_use]
pub fn infer_resource_type(returns: &ReturnType) -> Option<TypeRef> {
    match returns {
        ReturnType::Unit | ReturnType::Completion => None,
        ReturnType::Value(ty) => Some(ty.clone()),
        ReturnType::Task(inner) => infer_resource_type(inner),
    }
}

/// Extract the chain metadata for a handler description.
///
/// # Errors
///
/// Returns a [`CompilationError`] naming the conflicting declarations when
/// annotations are ambiguous.
pub fn extract_metadata(descriptor: &HandlerDescriptor) -> Result<ChainMetadata, CompilationError> {
    let handler = descriptor.qualified_name();
    let annotations = annotations_with_origin(descriptor);

    let content_types = content_types(&annotations);
    let resource_type = resource_type(&handler, &annotations, &descriptor.returns)?;
    let request_type = body_parameter(&handler, &descriptor.parameters)?;
    let accepts = request_type.clone().map(|request_type| AcceptsMetadata {
        request_type,
        content_types: content_types.clone(),
    });
    let produces = produces(&handler, &annotations, resource_type.as_ref(), &content_types)?;
    let route = route(&handler, &annotations, &descriptor.parameters)?;
    let authorization = authorization(&annotations);

    let external_transaction = annotations
        .iter()
        .any(|(a, _)| matches!(a, Annotation::ExternalTransaction));
    let requires_outbox = descriptor.uses_message_bus() && !external_transaction;

    Ok(ChainMetadata {
        content_types,
        request_type,
        resource_type,
        accepts,
        produces,
        route,
        authorization,
        requires_outbox,
    })
}

/// Group annotations first, then method annotations.
fn annotations_with_origin(descriptor: &HandlerDescriptor) -> Vec<(&Annotation, &'static str)> {
    descriptor
        .group
        .annotations
        .iter()
        .map(|a| (a, GROUP))
        .chain(descriptor.annotations.iter().map(|a| (a, METHOD)))
        .collect()
}

fn content_types(annotations: &[(&Annotation, &'static str)]) -> Vec<String> {
    let declared_at = |origin: &str| -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for (annotation, from) in annotations {
            let Annotation::ContentType(list) = annotation else {
                continue;
            };
            if *from != origin {
                continue;
            }
            for ty in list {
                if !types.contains(ty) {
                    types.push(ty.clone());
                }
            }
        }
        types
    };

    let method = declared_at(METHOD);
    if !method.is_empty() {
        return method;
    }
    let group = declared_at(GROUP);
    if !group.is_empty() {
        return group;
    }
    vec![JSON_CONTENT_TYPE.to_string()]
}

fn resource_type(
    handler: &str,
    annotations: &[(&Annotation, &'static str)],
    returns: &ReturnType,
) -> Result<Option<TypeRef>, CompilationError> {
    let mut explicit: Option<(&TypeRef, &'static str)> = None;
    for (annotation, origin) in annotations {
        let Annotation::ResourceType(ty) = annotation else {
            continue;
        };
        match explicit {
            Some((first, first_origin)) if first != ty => {
                return Err(CompilationError::ConflictingResourceType {
                    handler: handler.to_string(),
                    first: first.to_string(),
                    first_origin,
                    second: ty.to_string(),
                    second_origin: *origin,
                });
            }
            Some(_) => {}
            None => explicit = Some((ty, *origin)),
        }
    }

    Ok(explicit.map_or_else(|| infer_resource_type(returns), |(ty, _)| Some(ty.clone())))
}

fn body_parameter(handler: &str, parameters: &[Parameter]) -> Result<Option<TypeRef>, CompilationError> {
    let mut bodies = parameters.iter().filter_map(|p| match p {
        Parameter::Body(ty) => Some(ty),
        _ => None,
    });
    let first = bodies.next().cloned();
    if bodies.next().is_some() {
        return Err(CompilationError::MultipleBodies {
            handler: handler.to_string(),
        });
    }
    Ok(first)
}

fn describe_body(body: Option<&TypeRef>) -> String {
    body.map_or_else(|| "no body".to_string(), ToString::to_string)
}

fn produces(
    handler: &str,
    annotations: &[(&Annotation, &'static str)],
    resource_type: Option<&TypeRef>,
    content_types: &[String],
) -> Result<Vec<ProducesMetadata>, CompilationError> {
    let mut produces = Vec::with_capacity(BASELINE_FAILURES.len() + 1);
    match resource_type {
        Some(ty) => produces.push(ProducesMetadata {
            status: 200,
            body: Some(ty.clone()),
            content_types: content_types.to_vec(),
        }),
        None => produces.push(ProducesMetadata {
            status: 204,
            body: None,
            content_types: Vec::new(),
        }),
    }
    produces.extend(BASELINE_FAILURES.iter().map(|&status| ProducesMetadata {
        status,
        body: None,
        content_types: Vec::new(),
    }));

    let mut declared: Vec<(u16, Option<&TypeRef>, &'static str)> = Vec::new();
    for (annotation, origin) in annotations {
        let Annotation::Status { code, body } = annotation else {
            continue;
        };
        if let Some(&(_, first, first_origin)) = declared.iter().find(|(c, _, _)| c == code) {
            if first != body.as_ref() {
                return Err(CompilationError::ConflictingStatusMapping {
                    handler: handler.to_string(),
                    status: *code,
                    first: describe_body(first),
                    first_origin,
                    second: describe_body(body.as_ref()),
                    second_origin: *origin,
                });
            }
            continue;
        }
        declared.push((*code, body.as_ref(), *origin));
    }

    for (status, body, _) in declared {
        let record = ProducesMetadata {
            status,
            body: body.cloned(),
            content_types: if body.is_some() {
                content_types.to_vec()
            } else {
                Vec::new()
            },
        };
        match produces.iter_mut().find(|p| p.status == status) {
            Some(existing) => *existing = record,
            None => produces.push(record),
        }
    }

    Ok(produces)
}

fn route(
    handler: &str,
    annotations: &[(&Annotation, &'static str)],
    parameters: &[Parameter],
) -> Result<Option<RouteInfo>, CompilationError> {
    let declared_at = |origin: &'static str| -> Result<Option<RouteInfo>, CompilationError> {
        let mut routes = annotations.iter().filter_map(|(a, from)| match a {
            Annotation::Route { method, pattern } if *from == origin => Some((method, pattern)),
            _ => None,
        });
        let first = routes.next();
        if routes.next().is_some() {
            return Err(CompilationError::DuplicateRoute {
                handler: handler.to_string(),
                origin,
            });
        }
        Ok(first.map(|(method, pattern)| RouteInfo {
            method: method.clone(),
            pattern: pattern.clone(),
            parameters: ROUTE_PARAMETER
                .captures_iter(pattern)
                .map(|c| c[1].to_string())
                .collect(),
        }))
    };

    let group = declared_at(GROUP)?;
    let route = declared_at(METHOD)?.or(group);

    for parameter in parameters {
        let Parameter::Route(name) = parameter else {
            continue;
        };
        let known = route
            .as_ref()
            .is_some_and(|r| r.parameters.iter().any(|p| p == name));
        if !known {
            return Err(CompilationError::UnknownRouteParameter {
                handler: handler.to_string(),
                parameter: name.clone(),
                pattern: route.as_ref().map(|r| r.pattern.clone()).unwrap_or_default(),
            });
        }
    }

    Ok(route)
}

fn authorization(annotations: &[(&Annotation, &'static str)]) -> AuthorizationRequirement {
    let mut requirement = AuthorizationRequirement::default();
    for (annotation, _) in annotations {
        if let Annotation::Authorize { policy } = annotation {
            requirement.required = true;
            if let Some(policy) = policy {
                requirement.policies.insert(policy.clone());
            }
        }
    }
    requirement
}
