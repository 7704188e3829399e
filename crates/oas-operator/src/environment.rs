//! Process environment read once at startup

use oas_common::OPERATOR_NAMESPACE;
use oas_controllers::WorkloadImages;

/// Operand image reference
pub const IMAGE_ENV: &str = "IMAGE";
/// Operator image reference
pub const OPERATOR_IMAGE_ENV: &str = "OPERATOR_IMAGE";
/// Version of the operator image, published under the `operator` key
pub const OPERATOR_IMAGE_VERSION_ENV: &str = "OPERATOR_IMAGE_VERSION";
/// Namespace the operator pod runs in
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
/// Name of the operator pod
pub const POD_NAME_ENV: &str = "POD_NAME";

/// Values supplied by the hosting process
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatorEnvironment {
    /// Operand image
    pub image: String,
    /// Operator image
    pub operator_image: String,
    /// Operator image version
    pub operator_image_version: String,
    /// Namespace the operator runs in
    pub namespace: String,
    /// Pod name, used as leader-election identity
    pub pod_name: Option<String>,
}

impl OperatorEnvironment {
    /// Read from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary lookup. Unset values become empty, except
    /// the namespace which falls back to the operator's default namespace.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| lookup(key).unwrap_or_default();
        Self {
            image: value(IMAGE_ENV),
            operator_image: value(OPERATOR_IMAGE_ENV),
            operator_image_version: value(OPERATOR_IMAGE_VERSION_ENV),
            namespace: lookup(POD_NAMESPACE_ENV)
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| OPERATOR_NAMESPACE.to_string()),
            pod_name: lookup(POD_NAME_ENV).filter(|name| !name.is_empty()),
        }
    }

    /// Images handed to the workload controller
    pub fn workload_images(&self) -> WorkloadImages {
        WorkloadImages {
            image: self.image.clone(),
            operator_image: self.operator_image.clone(),
            version: self.operator_image_version.clone(),
        }
    }

    /// Identity used when competing for the leader lease
    pub fn identity(&self) -> String {
        self.pod_name
            .clone()
            .unwrap_or_else(|| format!("oas-operator-{}", std::process::id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_every_value() {
        let env = OperatorEnvironment::from_lookup(lookup(&[
            (IMAGE_ENV, "quay.io/openshift/apiserver:4.15"),
            (OPERATOR_IMAGE_ENV, "quay.io/openshift/apiserver-operator:4.15"),
            (OPERATOR_IMAGE_VERSION_ENV, "4.15.0"),
            (POD_NAMESPACE_ENV, "custom-ns"),
            (POD_NAME_ENV, "operator-abc"),
        ]));
        assert_eq!(env.image, "quay.io/openshift/apiserver:4.15");
        assert_eq!(env.operator_image_version, "4.15.0");
        assert_eq!(env.namespace, "custom-ns");
        assert_eq!(env.identity(), "operator-abc");
        assert_eq!(env.workload_images().version, "4.15.0");
    }

    #[test]
    fn missing_values_fall_back() {
        let env = OperatorEnvironment::from_lookup(lookup(&[]));
        assert!(env.image.is_empty());
        assert!(env.operator_image_version.is_empty());
        assert_eq!(env.namespace, OPERATOR_NAMESPACE);
        assert!(env.pod_name.is_none());
        assert!(env.identity().starts_with("oas-operator-"));
    }
}
