//! Desired-cluster description: `ClusterSpec`, `InstanceTemplate`, `KeyMaterial`.
//!
//! A spec is built once per invocation, validated before any provider call
//! and shared read-only across every role worker of an action.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use cluster_compute::ProviderSettings;

use crate::error::{ClusterError, Result};

/// Property keys understood by [`ClusterSpec::from_properties`].
pub mod keys {
    pub const PROVIDER: &str = "cluster.provider";
    pub const IDENTITY: &str = "cluster.identity";
    pub const CREDENTIAL: &str = "cluster.credential";
    pub const CLUSTER_NAME: &str = "cluster.name";
    pub const SERVICE_NAME: &str = "cluster.service-name";
    pub const INSTANCE_TEMPLATES: &str = "cluster.instance-templates";
    pub const PRIVATE_KEY_FILE: &str = "cluster.private-key-file";
    pub const PUBLIC_KEY_FILE: &str = "cluster.public-key-file";
    pub const VERSION: &str = "cluster.version";

    /// Keys lifted into typed fields rather than kept as free-form properties.
    pub const RESERVED: [&str; 9] = [
        PROVIDER,
        IDENTITY,
        CREDENTIAL,
        CLUSTER_NAME,
        SERVICE_NAME,
        INSTANCE_TEMPLATES,
        PRIVATE_KEY_FILE,
        PUBLIC_KEY_FILE,
        VERSION,
    ];
}

fn cluster_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("cluster name pattern compiles"))
}

fn role_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("role name pattern compiles"))
}

// ---------------------------------------------------------------------------
// InstanceTemplate
// ---------------------------------------------------------------------------

/// A request for `count` instances that all play the same role set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceTemplate {
    count: u32,
    roles: BTreeSet<String>,
}

impl InstanceTemplate {
    pub fn new<I, S>(count: u32, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            count,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Parse one group such as `2 datanode+tasktracker`.
    pub fn parse(group: &str) -> Result<Self> {
        let group = group.trim();
        let (count, roles) = group.split_once(char::is_whitespace).ok_or_else(|| {
            ClusterError::Configuration(format!(
                "instance template '{group}' must look like '<count> <role>[+<role>...]'"
            ))
        })?;

        let count: u32 = count.trim().parse().map_err(|_| {
            ClusterError::Configuration(format!(
                "instance template '{group}' has an invalid count '{count}'"
            ))
        })?;

        let mut seen = BTreeSet::new();
        for role in roles.trim().split('+').map(str::trim) {
            if role.is_empty() {
                return Err(ClusterError::Configuration(format!(
                    "instance template '{group}' has an empty role name"
                )));
            }
            if !seen.insert(role.to_string()) {
                return Err(ClusterError::Configuration(format!(
                    "instance template '{group}' lists role '{role}' more than once"
                )));
            }
        }

        Ok(Self {
            count,
            roles: seen,
        })
    }

    /// Parse a comma-separated list such as `1 nn+jt,3 dn+tt`.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl std::fmt::Display for InstanceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let roles: Vec<&str> = self.roles.iter().map(String::as_str).collect();
        write!(f, "{} {}", self.count, roles.join("+"))
    }
}

// ---------------------------------------------------------------------------
// KeyMaterial
// ---------------------------------------------------------------------------

/// File-backed key used to reach instances.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    path: PathBuf,
    contents: String,
}

impl KeyMaterial {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// Read a key from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Configuration(format!("cannot read key file {}: {e}", path.display()))
        })?;
        Ok(Self::new(path, contents))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("path", &self.path)
            .field("contents", &"<redacted>")
            .finish()
    }
}

/// Default public key location for a private key: `<private>.pub`.
pub fn public_key_path_for(private_key: &Path) -> PathBuf {
    let mut name = private_key.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// ClusterSpec
// ---------------------------------------------------------------------------

/// Immutable description of a desired cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    provider: String,
    identity: String,
    credential: String,
    cluster_name: String,
    service_name: String,
    instance_templates: Vec<InstanceTemplate>,
    private_key: Option<KeyMaterial>,
    public_key: Option<KeyMaterial>,
    properties: BTreeMap<String, String>,
    version: Option<String>,
}

impl ClusterSpec {
    pub fn builder() -> ClusterSpecBuilder {
        ClusterSpecBuilder::default()
    }

    /// Build a spec from flat `cluster.*` properties.
    ///
    /// Unreserved keys are kept verbatim as free-form properties. When only a
    /// private key file is named, the public key is read from `<private>.pub`.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| properties.get(key).cloned().unwrap_or_default();

        let mut builder = ClusterSpec::builder()
            .provider(get(keys::PROVIDER))
            .identity(get(keys::IDENTITY))
            .credential(get(keys::CREDENTIAL))
            .cluster_name(get(keys::CLUSTER_NAME))
            .service_name(get(keys::SERVICE_NAME));

        if let Some(list) = properties.get(keys::INSTANCE_TEMPLATES) {
            builder = builder.instance_templates(InstanceTemplate::parse_list(list)?);
        }
        if let Some(version) = properties.get(keys::VERSION) {
            builder = builder.version(version.clone());
        }

        if let Some(private) = properties.get(keys::PRIVATE_KEY_FILE) {
            let private = PathBuf::from(private);
            let public = properties
                .get(keys::PUBLIC_KEY_FILE)
                .map(PathBuf::from)
                .unwrap_or_else(|| public_key_path_for(&private));
            builder = builder
                .private_key(KeyMaterial::from_file(&private)?)
                .public_key(KeyMaterial::from_file(&public)?);
        } else if let Some(public) = properties.get(keys::PUBLIC_KEY_FILE) {
            builder = builder.public_key(KeyMaterial::from_file(public)?);
        }

        for (key, value) in properties {
            if !keys::RESERVED.contains(&key.as_str()) {
                builder = builder.property(key.clone(), value.clone());
            }
        }

        Ok(builder.build())
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance_templates(&self) -> &[InstanceTemplate] {
        &self.instance_templates
    }

    pub fn private_key(&self) -> Option<&KeyMaterial> {
        self.private_key.as_ref()
    }

    pub fn public_key(&self) -> Option<&KeyMaterial> {
        self.public_key.as_ref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Sum of instance counts across all templates.
    pub fn total_instance_count(&self) -> u64 {
        self.instance_templates
            .iter()
            .map(|t| u64::from(t.count))
            .sum()
    }

    /// Distinct role names across all templates.
    pub fn roles(&self) -> BTreeSet<&str> {
        self.instance_templates
            .iter()
            .flat_map(|t| t.roles.iter().map(String::as_str))
            .collect()
    }

    /// Settings handed to the compute context builder.
    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            provider: self.provider.clone(),
            identity: self.identity.clone(),
            credential: self.credential.clone(),
            properties: self.properties.clone(),
        }
    }

    /// SHA-256 hex digest of the cluster layout.
    ///
    /// Covers provider, names, version and templates in order; credentials,
    /// keys and free-form properties are excluded.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.provider.as_str(),
            self.cluster_name.as_str(),
            self.service_name.as_str(),
            self.version.as_deref().unwrap_or(""),
        ] {
            hasher.update(field.as_bytes());
            hasher.update(b"\0");
        }
        for template in &self.instance_templates {
            hasher.update(template.to_string().as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    /// Check the fields every action needs: provider and a taggable cluster name.
    pub fn validate_target(&self) -> Result<()> {
        if self.provider.trim().is_empty() {
            return Err(ClusterError::Configuration(
                "no compute provider specified".to_string(),
            ));
        }
        if self.cluster_name.is_empty() {
            return Err(ClusterError::Configuration(
                "no cluster name specified".to_string(),
            ));
        }
        if !cluster_name_pattern().is_match(&self.cluster_name) {
            return Err(ClusterError::Configuration(format!(
                "cluster name '{}' must be lowercase letters, digits and dashes",
                self.cluster_name
            )));
        }
        Ok(())
    }

    /// Full validation for phases that provision or act on role groups.
    pub fn validate(&self) -> Result<()> {
        self.validate_target()?;
        if self.instance_templates.is_empty() {
            return Err(ClusterError::Configuration(
                "at least one instance template is required".to_string(),
            ));
        }
        for (index, template) in self.instance_templates.iter().enumerate() {
            if template.count == 0 {
                return Err(ClusterError::Configuration(format!(
                    "instance template {index} ({template}) must request at least one instance"
                )));
            }
            if template.roles.is_empty() {
                return Err(ClusterError::Configuration(format!(
                    "instance template {index} has no roles"
                )));
            }
            if let Some(bad) = template
                .roles
                .iter()
                .find(|r| !role_name_pattern().is_match(r))
            {
                return Err(ClusterError::Configuration(format!(
                    "instance template {index} has an invalid role name '{bad}'"
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClusterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSpec")
            .field("provider", &self.provider)
            .field("identity", &self.identity)
            .field("credential", &"<redacted>")
            .field("cluster_name", &self.cluster_name)
            .field("service_name", &self.service_name)
            .field("instance_templates", &self.instance_templates)
            .field("private_key", &self.private_key)
            .field("public_key", &self.public_key)
            .field("properties", &self.properties)
            .field("version", &self.version)
            .finish()
    }
}

/// Builder for [`ClusterSpec`]. Validation happens when an action runs.
#[derive(Debug, Default)]
pub struct ClusterSpecBuilder {
    provider: String,
    identity: String,
    credential: String,
    cluster_name: String,
    service_name: String,
    instance_templates: Vec<InstanceTemplate>,
    private_key: Option<KeyMaterial>,
    public_key: Option<KeyMaterial>,
    properties: BTreeMap<String, String>,
    version: Option<String>,
}

impl ClusterSpecBuilder {
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn instance_template(mut self, template: InstanceTemplate) -> Self {
        self.instance_templates.push(template);
        self
    }

    pub fn instance_templates(mut self, templates: Vec<InstanceTemplate>) -> Self {
        self.instance_templates = templates;
        self
    }

    pub fn private_key(mut self, key: KeyMaterial) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn public_key(mut self, key: KeyMaterial) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn build(self) -> ClusterSpec {
        ClusterSpec {
            provider: self.provider,
            identity: self.identity,
            credential: self.credential,
            cluster_name: self.cluster_name,
            service_name: self.service_name,
            instance_templates: self.instance_templates,
            private_key: self.private_key,
            public_key: self.public_key,
            properties: self.properties,
            version: self.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> ClusterSpec {
        ClusterSpec::builder()
            .provider("stub")
            .cluster_name("test-cluster")
            .service_name("hadoop")
            .instance_templates(InstanceTemplate::parse_list("1 nn+jt,2 dn+tt").unwrap())
            .build()
    }

    #[test]
    fn test_parse_list_keeps_order_and_role_sets() {
        let templates = InstanceTemplate::parse_list("1 role1+role2,2 role3").unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0], InstanceTemplate::new(1, ["role1", "role2"]));
        assert_eq!(templates[1], InstanceTemplate::new(2, ["role3"]));
    }

    #[test]
    fn test_parse_rejects_duplicate_role_in_one_group() {
        let err = InstanceTemplate::parse("2 a+a").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_parse_rejects_bad_counts_and_shapes() {
        assert!(InstanceTemplate::parse("x role").is_err());
        assert!(InstanceTemplate::parse("-1 role").is_err());
        assert!(InstanceTemplate::parse("role").is_err());
        assert!(InstanceTemplate::parse("1 a++b").is_err());
    }

    #[test]
    fn test_parse_allows_zero_count_until_validation() {
        let template = InstanceTemplate::parse("0 a").unwrap();
        assert_eq!(template.count(), 0);
    }

    #[test]
    fn test_overlapping_templates_are_distinct_requests() {
        let spec = ClusterSpec::builder()
            .provider("stub")
            .cluster_name("c")
            .instance_template(InstanceTemplate::new(1, ["a"]))
            .instance_template(InstanceTemplate::new(2, ["a"]))
            .build();
        assert_eq!(spec.instance_templates().len(), 2);
        assert_eq!(spec.total_instance_count(), 3);
        assert_eq!(spec.roles().len(), 1);
    }

    #[test]
    fn test_total_instance_count_and_roles() {
        let spec = valid_spec();
        assert_eq!(spec.total_instance_count(), 3);
        let roles: Vec<&str> = spec.roles().into_iter().collect();
        assert_eq!(roles, vec!["dn", "jt", "nn", "tt"]);
    }

    #[test]
    fn test_validate_accepts_well_formed_spec() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_provider() {
        let spec = ClusterSpec::builder()
            .cluster_name("c")
            .instance_template(InstanceTemplate::new(1, ["a"]))
            .build();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("provider"));
    }

    #[test]
    fn test_validate_rejects_empty_templates_and_zero_counts() {
        let empty = ClusterSpec::builder().provider("stub").cluster_name("c").build();
        assert!(empty.validate().is_err());
        assert!(empty.validate_target().is_ok());

        let zero = ClusterSpec::builder()
            .provider("stub")
            .cluster_name("c")
            .instance_template(InstanceTemplate::new(0, ["a"]))
            .build();
        assert!(zero.validate().unwrap_err().to_string().contains("at least one instance"));
    }

    #[test]
    fn test_validate_rejects_untaggable_cluster_name_and_bad_roles() {
        let spec = ClusterSpec::builder()
            .provider("stub")
            .cluster_name("My Cluster")
            .instance_template(InstanceTemplate::new(1, ["a"]))
            .build();
        assert!(spec.validate_target().is_err());

        let spec = ClusterSpec::builder()
            .provider("stub")
            .cluster_name("c")
            .instance_template(InstanceTemplate::new(1, ["bad role"]))
            .build();
        assert!(spec.validate().unwrap_err().to_string().contains("bad role"));

        let spec = ClusterSpec::builder()
            .provider("stub")
            .cluster_name("c")
            .instance_template(InstanceTemplate::new(1, Vec::<String>::new()))
            .build();
        assert!(spec.validate().unwrap_err().to_string().contains("no roles"));
    }

    #[test]
    fn test_digest_is_stable_and_layout_sensitive() {
        let a = valid_spec();
        let b = valid_spec();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let reordered = ClusterSpec::builder()
            .provider("stub")
            .cluster_name("test-cluster")
            .service_name("hadoop")
            .instance_templates(InstanceTemplate::parse_list("2 dn+tt,1 nn+jt").unwrap())
            .build();
        assert_ne!(a.digest(), reordered.digest());
    }

    #[test]
    fn test_digest_ignores_credentials() {
        let a = ClusterSpec::builder()
            .provider("stub")
            .cluster_name("c")
            .credential("one")
            .build();
        let b = ClusterSpec::builder()
            .provider("stub")
            .cluster_name("c")
            .credential("two")
            .build();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_debug_redacts_credential() {
        let spec = ClusterSpec::builder().credential("s3cret").build();
        assert!(!format!("{spec:?}").contains("s3cret"));
    }

    #[test]
    fn test_from_properties_splits_reserved_and_free_form_keys() {
        let mut props = BTreeMap::new();
        props.insert(keys::PROVIDER.to_string(), "stub".to_string());
        props.insert(keys::CLUSTER_NAME.to_string(), "c1".to_string());
        props.insert(keys::SERVICE_NAME.to_string(), "svc".to_string());
        props.insert(keys::IDENTITY.to_string(), "me".to_string());
        props.insert(keys::CREDENTIAL.to_string(), "pw".to_string());
        props.insert(keys::INSTANCE_TEMPLATES.to_string(), "1 a+b,2 c".to_string());
        props.insert(keys::VERSION.to_string(), "0.9".to_string());
        props.insert("hadoop.heap".to_string(), "2g".to_string());

        let spec = ClusterSpec::from_properties(&props).unwrap();
        assert_eq!(spec.provider(), "stub");
        assert_eq!(spec.cluster_name(), "c1");
        assert_eq!(spec.service_name(), "svc");
        assert_eq!(spec.identity(), "me");
        assert_eq!(spec.credential(), "pw");
        assert_eq!(spec.version(), Some("0.9"));
        assert_eq!(spec.instance_templates().len(), 2);
        assert_eq!(spec.property("hadoop.heap"), Some("2g"));
        assert!(spec.property(keys::PROVIDER).is_none());
    }

    #[test]
    fn test_from_properties_reports_missing_key_file() {
        let mut props = BTreeMap::new();
        props.insert(
            keys::PRIVATE_KEY_FILE.to_string(),
            "/nonexistent/id_rsa".to_string(),
        );
        let err = ClusterSpec::from_properties(&props).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("id_rsa"));
    }

    #[test]
    fn test_public_key_path_defaults_to_pub_suffix() {
        assert_eq!(
            public_key_path_for(Path::new("/home/me/.ssh/id_rsa")),
            PathBuf::from("/home/me/.ssh/id_rsa.pub")
        );
    }
}
