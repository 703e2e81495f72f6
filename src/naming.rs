//! Load balancer naming
//!
//! Provider load balancer names are limited to 32 characters. Names that
//! fit are human readable (`<cluster>-apiserver`); longer ones are replaced
//! by a deterministic hash so the same cluster always maps to the same name.
//! The hash output is a compatibility contract with existing clusters and
//! must not change.

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;

use crate::crd::ControlPlaneLoadBalancerSpec;
use crate::domain::ElbScope;
use crate::error::{Error, Result};

/// Maximum length of a provider load balancer name
pub const MAX_NAME_LENGTH: usize = 32;

const APISERVER_SUFFIX: &str = "-apiserver";
const HASHED_SUFFIX: &str = "-k8s";
const HASH_LENGTH: usize = 28;
const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Hash `input` with an unkeyed BLAKE2b of `len` bytes and map each byte
/// to a lowercase base36 digit
pub fn base36_truncated_hash(input: &str, len: usize) -> Result<String> {
    let mut hasher = Blake2bVar::new(len)
        .map_err(|e| Error::Internal(format!("unable to create hash function: {}", e)))?;
    hasher.update(input.as_bytes());

    let mut digest = vec![0u8; len];
    hasher
        .finalize_variable(&mut digest)
        .map_err(|e| Error::Internal(format!("unable to finalize hash: {}", e)))?;

    Ok(digest
        .iter()
        .map(|b| BASE36_ALPHABET[(*b as usize) % BASE36_ALPHABET.len()] as char)
        .collect())
}

/// Derive a load balancer name from `base`
pub fn generate_elb_name(base: &str) -> Result<String> {
    let standard = format!("{}{}", base.replace('.', "-"), APISERVER_SUFFIX);
    if standard.len() <= MAX_NAME_LENGTH {
        return Ok(standard);
    }

    let hashed = base36_truncated_hash(base, HASH_LENGTH)
        .map_err(|e| e.context(format!("unable to create load balancer name for {:?}", base)))?;
    Ok(format!("{}{}", hashed, HASHED_SUFFIX))
}

/// Name of the primary classic load balancer
pub fn elb_name(scope: &dyn ElbScope) -> Result<String> {
    if let Some(name) = scope
        .control_plane_load_balancer()
        .and_then(|spec| spec.name.as_ref())
    {
        return Ok(name.clone());
    }
    generate_elb_name(scope.name())
}

/// Name of a modern-family load balancer declared by `spec`
pub fn lb_name(scope: &dyn ElbScope, spec: &ControlPlaneLoadBalancerSpec) -> Result<String> {
    if let Some(name) = &spec.name {
        return Ok(name.clone());
    }
    generate_elb_name(&format!("{}-{}", scope.namespace(), scope.name()))
}

/// Name of the load balancer declared by `spec`, following its family
///
/// Classic load balancers are always the primary and use [`elb_name`].
pub fn load_balancer_name(scope: &dyn ElbScope, spec: &ControlPlaneLoadBalancerSpec) -> Result<String> {
    if spec.load_balancer_type.is_classic() {
        elb_name(scope)
    } else {
        lb_name(scope, spec)
    }
}

/// Names of every load balancer declared for the cluster, primary first
pub fn control_plane_load_balancer_names(scope: &dyn ElbScope) -> Result<Vec<String>> {
    scope
        .control_plane_load_balancers()
        .iter()
        .map(|spec| load_balancer_name(scope, spec))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::crd::{LoadBalancerType, Scheme};

    #[test]
    fn test_short_name_is_readable() {
        assert_eq!(
            generate_elb_name("prod-east-1").unwrap(),
            "prod-east-1-apiserver"
        );
    }

    #[test]
    fn test_dots_are_replaced() {
        assert_eq!(
            generate_elb_name("team.prod").unwrap(),
            "team-prod-apiserver"
        );
    }

    #[test]
    fn test_long_name_is_hashed() {
        let name = generate_elb_name("a-very-long-cluster-name-for-production-use").unwrap();
        assert_eq!(name, "r8nlvdm31x73673keerzwp377gmi-k8s");
        assert_eq!(name.len(), MAX_NAME_LENGTH);
    }

    #[test]
    fn test_boundary_length() {
        // 22 + "-apiserver" is exactly the limit
        let base = "abcdefghijklmnopqrstuv";
        assert_eq!(generate_elb_name(base).unwrap().len(), MAX_NAME_LENGTH);
        assert!(generate_elb_name(base).unwrap().ends_with(APISERVER_SUFFIX));

        let longer = format!("{}w", base);
        assert!(generate_elb_name(&longer).unwrap().ends_with(HASHED_SUFFIX));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let first = base36_truncated_hash("prod-east-1", 28).unwrap();
        let second = base36_truncated_hash("prod-east-1", 28).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "jjtjxtqr06q63rthcl4rgjpdmpxb");
        assert!(first
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_classic_primary_uses_cluster_name() {
        let mut config = ClusterConfig::new("prod", "us-east-1");
        assert_eq!(control_plane_load_balancer_names(&config).unwrap(), vec!["prod-apiserver"]);

        config.control_plane_load_balancer = Some(ControlPlaneLoadBalancerSpec {
            scheme: Some(Scheme::Internal),
            ..Default::default()
        });
        assert_eq!(control_plane_load_balancer_names(&config).unwrap(), vec!["prod-apiserver"]);
    }

    #[test]
    fn test_names_follow_family() {
        let mut config = ClusterConfig::new("prod", "us-east-1");
        config.control_plane_load_balancer = Some(ControlPlaneLoadBalancerSpec {
            load_balancer_type: LoadBalancerType::Nlb,
            ..Default::default()
        });
        config.secondary_control_plane_load_balancer = Some(ControlPlaneLoadBalancerSpec {
            name: Some("internal-api".to_string()),
            load_balancer_type: LoadBalancerType::Nlb,
            ..Default::default()
        });
        assert_eq!(
            control_plane_load_balancer_names(&config).unwrap(),
            vec!["default-prod-apiserver", "internal-api"]
        );
    }

    #[test]
    fn test_namespaced_base_is_hashed_when_long() {
        assert_eq!(
            generate_elb_name("default-my-extremely-long-cluster-name-01").unwrap(),
            "73ziow61nzgzk5jn874sj4kiie26-k8s"
        );
    }
}
