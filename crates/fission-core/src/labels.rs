//! Label and annotation names stamped on orchestrator objects.
//!
//! The executor and the builder manager find their pods, deployments and
//! services again by these labels, including after a restart.

use std::collections::BTreeMap;

use crate::types::{DEFAULT_NAMESPACE, Environment, ObjectMeta};

pub const ENVIRONMENT_NAME: &str = "environmentName";
pub const ENVIRONMENT_NAMESPACE: &str = "environmentNamespace";
pub const ENVIRONMENT_UID: &str = "environmentUid";
pub const FUNCTION_NAME: &str = "functionName";
pub const FUNCTION_NAMESPACE: &str = "functionNamespace";
pub const FUNCTION_UID: &str = "functionUid";
pub const FUNCTION_RESOURCE_VERSION: &str = "functionResourceVersion";
pub const EXECUTOR_TYPE: &str = "executorType";
pub const EXECUTOR_INSTANCEID: &str = "executorInstanceId";
pub const MANAGED: &str = "managed";

/// Annotation carrying the specialized pod's `host:port`.
pub const ANNOTATION_SVC_HOST: &str = "svcHost";

/// Annotation bumped to roll a deployment's pods.
pub const ANNOTATION_CONFIG_VERSION: &str = "configVersion";

// Builder-side labels.
pub const BUILDER_ENV_NAME: &str = "envName";
pub const BUILDER_ENV_NAMESPACE: &str = "envNamespace";
pub const BUILDER_ENV_RESOURCE_VERSION: &str = "envResourceVersion";
pub const OWNER: &str = "owner";
pub const OWNER_BUILDERMGR: &str = "buildermgr";

/// Service account builder pods run as.
pub const BUILDER_SERVICE_ACCOUNT: &str = "fission-builder";
/// Role binding that lets the builder read packages.
pub const PACKAGE_GETTER_ROLE_BINDING: &str = "package-getter-binding";
pub const PACKAGE_GETTER_ROLE: &str = "package-getter";

/// Path prefix of the router's internal function routes.
pub const FUNCTION_URL_PREFIX: &str = "/fission-function";

/// Labels identifying an environment's pool pods.
pub fn environment_labels(env: &ObjectMeta) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ENVIRONMENT_NAME.to_string(), env.name.clone()),
        (ENVIRONMENT_NAMESPACE.to_string(), env.namespace.clone()),
        (ENVIRONMENT_UID.to_string(), env.uid.clone()),
    ])
}

/// Labels identifying a function's pods.
pub fn function_labels(func: &ObjectMeta, env: &ObjectMeta) -> BTreeMap<String, String> {
    let mut labels = environment_labels(env);
    labels.insert(FUNCTION_NAME.to_string(), func.name.clone());
    labels.insert(FUNCTION_NAMESPACE.to_string(), func.namespace.clone());
    labels.insert(FUNCTION_UID.to_string(), func.uid.clone());
    labels
}

/// Labels identifying the builder service and deployment of an environment
/// revision.
pub fn builder_labels(env: &Environment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (BUILDER_ENV_NAME.to_string(), env.metadata.name.clone()),
        (BUILDER_ENV_NAMESPACE.to_string(), env.metadata.namespace.clone()),
        (
            BUILDER_ENV_RESOURCE_VERSION.to_string(),
            env.metadata.resource_version.clone(),
        ),
        (OWNER.to_string(), OWNER_BUILDERMGR.to_string()),
    ])
}

/// Internal router URL of a function: the namespace segment is omitted for
/// the default namespace.
pub fn url_for_function(name: &str, namespace: &str) -> String {
    if namespace.is_empty() || namespace == DEFAULT_NAMESPACE {
        format!("{FUNCTION_URL_PREFIX}/{name}")
    } else {
        format!("{FUNCTION_URL_PREFIX}/{namespace}/{name}")
    }
}

/// Kubernetes-style object names are capped at 63 characters.
pub fn truncate_name(name: &str) -> String {
    let mut out: String = name.chars().take(63).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_url_omits_default_namespace() {
        assert_eq!(url_for_function("hello", "default"), "/fission-function/hello");
        assert_eq!(url_for_function("hello", ""), "/fission-function/hello");
        assert_eq!(url_for_function("hello", "team-a"), "/fission-function/team-a/hello");
    }

    #[test]
    fn function_labels_include_environment() {
        let f = ObjectMeta::new("ns", "fn");
        let e = ObjectMeta::new("ns", "py");
        let labels = function_labels(&f, &e);
        assert_eq!(labels[FUNCTION_NAME], "fn");
        assert_eq!(labels[ENVIRONMENT_NAME], "py");
    }

    #[test]
    fn truncated_names_are_dns_safe() {
        let long = format!("newdeploy-{}-", "x".repeat(60));
        let name = truncate_name(&long);
        assert!(name.len() <= 63);
        assert!(!name.ends_with('-'));
    }
}
