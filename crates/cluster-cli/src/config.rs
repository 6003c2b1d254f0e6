//! Cluster properties assembled from a TOML file and command-line flags.
//!
//! Nested tables flatten into dotted keys, so
//!
//! ```toml
//! [cluster]
//! name = "hadoop"
//! instance-templates = "1 nn+jt,3 dn+tt"
//!
//! [cluster.role.dn]
//! ports = ["tcp:50010", "tcp:50075"]
//! ```
//!
//! yields `cluster.name`, `cluster.instance-templates` and
//! `cluster.role.dn.ports = "tcp:50010,tcp:50075"`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use cluster_core::keys;

/// Options describing the target cluster, shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// TOML file with cluster properties; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Compute provider id; `stub` is an in-memory dry run resumed from the state file
    #[arg(long, env = "CLUSTER_PROVIDER")]
    pub provider: Option<String>,

    /// Provider identity (account or access key)
    #[arg(long, env = "CLUSTER_IDENTITY")]
    pub identity: Option<String>,

    /// Provider credential
    #[arg(long, env = "CLUSTER_CREDENTIAL", hide_env_values = true)]
    pub credential: Option<String>,

    /// Name used to tag every instance of the cluster
    #[arg(long)]
    pub cluster_name: Option<String>,

    /// Service the cluster runs
    #[arg(long)]
    pub service_name: Option<String>,

    /// Instance templates, e.g. "1 nn+jt,3 dn+tt"
    #[arg(long)]
    pub instance_templates: Option<String>,

    /// Private key installed on instances; the public key defaults to <file>.pub
    #[arg(long)]
    pub private_key_file: Option<PathBuf>,

    /// Public key file, when not next to the private key
    #[arg(long)]
    pub public_key_file: Option<PathBuf>,

    /// Version of the service software to install
    #[arg(long = "version", value_name = "VERSION")]
    pub software_version: Option<String>,

    /// Extra property as KEY=VALUE, e.g. cluster.role.web.ports=tcp:80
    #[arg(short = 'D', long = "property", value_parser = parse_property)]
    pub properties: Vec<(String, String)>,

    /// Where the cluster state is kept (default: .clusterctl/<cluster-name>.json)
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

impl ClusterArgs {
    /// Merge the config file, `-D` properties and flags, in rising precedence.
    pub fn to_properties(&self) -> Result<BTreeMap<String, String>> {
        let mut properties = match &self.config {
            Some(path) => load_properties(path)?,
            None => BTreeMap::new(),
        };
        properties.extend(self.properties.iter().cloned());

        let path_string = |p: &PathBuf| p.to_string_lossy().into_owned();
        let flags = [
            (keys::PROVIDER, self.provider.clone()),
            (keys::IDENTITY, self.identity.clone()),
            (keys::CREDENTIAL, self.credential.clone()),
            (keys::CLUSTER_NAME, self.cluster_name.clone()),
            (keys::SERVICE_NAME, self.service_name.clone()),
            (keys::INSTANCE_TEMPLATES, self.instance_templates.clone()),
            (keys::PRIVATE_KEY_FILE, self.private_key_file.as_ref().map(path_string)),
            (keys::PUBLIC_KEY_FILE, self.public_key_file.as_ref().map(path_string)),
            (keys::VERSION, self.software_version.clone()),
        ];
        for (key, value) in flags {
            if let Some(value) = value {
                properties.insert(key.to_string(), value);
            }
        }
        Ok(properties)
    }
}

fn parse_property(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty property key in '{raw}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Read a TOML file and flatten it into dotted property keys.
pub fn load_properties(path: &Path) -> Result<BTreeMap<String, String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let table: toml::Table = raw
        .parse()
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    let mut properties = BTreeMap::new();
    for (key, value) in &table {
        flatten(key, value, &mut properties)?;
    }
    Ok(properties)
}

fn flatten(key: &str, value: &toml::Value, out: &mut BTreeMap<String, String>) -> Result<()> {
    match value {
        toml::Value::Table(table) => {
            for (child, value) in table {
                flatten(&format!("{key}.{child}"), value, out)?;
            }
        }
        toml::Value::Array(items) => {
            let rendered = items
                .iter()
                .map(|item| scalar(key, item))
                .collect::<Result<Vec<_>>>()?;
            out.insert(key.to_string(), rendered.join(","));
        }
        other => {
            out.insert(key.to_string(), scalar(key, other)?);
        }
    }
    Ok(())
}

fn scalar(key: &str, value: &toml::Value) -> Result<String> {
    Ok(match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        toml::Value::Array(_) | toml::Value::Table(_) => {
            bail!("property '{key}' nests too deeply to flatten")
        }
    })
}
