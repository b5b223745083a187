//! Package configuration.
//!
//! Packages carry an optional `vimg.toml`:
//!
//! ```toml
//! [vm]
//! name = "hello"
//! kernel = "latest"
//! cpus = 2
//! ram = "512 MiB"
//! disk_size = "+64 MiB"
//! inodes = 0
//!
//! [system]
//! hostname = "hello"
//!
//! [[program]]
//! binary = "/bin/hello"
//! args = ["--port", "8080"]
//!
//! [[network]]
//! ip = "dhcp"
//! http = [8080]
//! ```
//!
//! The file is parsed into raw `*Toml` structs that reject unknown fields,
//! then normalized into [`VmConfig`], which is what the rest of the crate sees
//! and what gets serialized into the boot partition as `config.json`.

use crate::error::{ImageError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "vimg.toml";
pub const DEFAULT_KERNEL: &str = "latest";
const DEFAULT_RAM: u64 = 256 * 1024 * 1024;

/// Requested disk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DiskSize {
    /// As small as the contents allow.
    #[default]
    Auto,
    /// An absolute size in bytes.
    Exact(u64),
    /// The minimum plus this many bytes.
    Extra(u64),
}

impl DiskSize {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match text.strip_prefix('+') {
            Some(rest) => Ok(Self::Extra(parse_size(rest)?)),
            None => Ok(Self::Exact(parse_size(text)?)),
        }
    }
}

impl TryFrom<String> for DiskSize {
    type Error = ImageError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DiskSize> for String {
    fn from(value: DiskSize) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Exact(bytes) => write!(f, "{bytes}"),
            Self::Extra(bytes) => write!(f, "+{bytes}"),
        }
    }
}

/// Parse `"512"`, `"64K"`, `"512 MiB"`, `"2G"`. Suffixes are binary.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    if digits.is_empty() {
        return Err(ImageError::InvalidConfig(format!(
            "size '{text}' does not start with a number"
        )));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| ImageError::InvalidConfig(format!("size '{text}' is out of range")))?;
    let shift = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        other => {
            return Err(ImageError::InvalidConfig(format!(
                "unknown size unit '{other}' in '{text}'"
            )))
        }
    };
    value
        .checked_mul(1_u64 << shift)
        .ok_or_else(|| ImageError::InvalidConfig(format!("size '{text}' is out of range")))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgramConfig {
    pub binary: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// An address, or `dhcp`.
    pub ip: String,
    pub gateway: String,
    pub mask: String,
    pub http: Vec<u16>,
    pub tcp: Vec<u16>,
    pub udp: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NfsMount {
    pub server: String,
    pub mount_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub config: Vec<String>,
}

/// The configuration of one VM, as the builder consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub name: String,
    /// Kernel version, or `latest`.
    pub kernel: String,
    pub kernel_args: Vec<String>,
    pub cpus: u32,
    /// Bytes.
    pub ram: u64,
    pub disk_size: DiskSize,
    /// `0` sizes the inode table automatically.
    pub inodes: u64,
    pub hostname: String,
    pub programs: Vec<ProgramConfig>,
    pub networks: Vec<NetworkConfig>,
    pub nfs: Vec<NfsMount>,
    pub logging: Vec<LoggingConfig>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "vimg".to_string(),
            kernel: DEFAULT_KERNEL.to_string(),
            kernel_args: Vec::new(),
            cpus: 1,
            ram: DEFAULT_RAM,
            disk_size: DiskSize::Auto,
            inodes: 0,
            hostname: String::new(),
            programs: Vec::new(),
            networks: Vec::new(),
            nfs: Vec::new(),
            logging: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct VimgToml {
    vm: Option<VmToml>,
    system: Option<SystemToml>,
    #[serde(default)]
    program: Vec<ProgramConfig>,
    #[serde(default)]
    network: Vec<NetworkConfig>,
    #[serde(default)]
    nfs: Vec<NfsMount>,
    #[serde(default)]
    logging: Vec<LoggingConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct VmToml {
    name: Option<String>,
    kernel: Option<String>,
    kernel_args: Option<Vec<String>>,
    cpus: Option<u32>,
    ram: Option<String>,
    disk_size: Option<String>,
    inodes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SystemToml {
    hostname: Option<String>,
}

impl VmConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: VimgToml =
            toml::from_str(text).map_err(|e| ImageError::InvalidConfig(e.to_string()))?;
        let defaults = Self::default();
        let vm = parsed.vm.unwrap_or_default();
        let system = parsed.system.unwrap_or_default();

        let config = Self {
            name: vm.name.map(|n| n.trim().to_string()).unwrap_or(defaults.name),
            kernel: vm
                .kernel
                .map(|k| k.trim().to_string())
                .unwrap_or(defaults.kernel),
            kernel_args: vm.kernel_args.unwrap_or_default(),
            cpus: vm.cpus.unwrap_or(defaults.cpus),
            ram: vm.ram.as_deref().map(parse_size).transpose()?.unwrap_or(defaults.ram),
            disk_size: vm
                .disk_size
                .as_deref()
                .map(DiskSize::parse)
                .transpose()?
                .unwrap_or_default(),
            inodes: vm.inodes.unwrap_or(0),
            hostname: system.hostname.unwrap_or_default(),
            programs: parsed.program,
            networks: parsed.network,
            nfs: parsed.nfs,
            logging: parsed.logging,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| ImageError::resource(path, e))?;
        Self::from_toml_str(&text).map_err(|err| match err {
            ImageError::InvalidConfig(msg) => {
                ImageError::InvalidConfig(format!("'{}': {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.kernel.trim().is_empty() {
            return Err(ImageError::InvalidConfig("kernel version is empty".into()));
        }
        if self.cpus == 0 {
            return Err(ImageError::InvalidConfig("cpus must be at least 1".into()));
        }
        if self.ram == 0 {
            return Err(ImageError::InvalidConfig("ram must be non-zero".into()));
        }
        if !self
            .hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(ImageError::InvalidConfig(format!(
                "hostname '{}' contains invalid characters",
                self.hostname
            )));
        }
        for (i, program) in self.programs.iter().enumerate() {
            if program.binary.trim().is_empty() {
                return Err(ImageError::InvalidConfig(format!(
                    "program {i} has no binary"
                )));
            }
            if let Some(bad) = program.env.iter().find(|kv| !kv.contains('=')) {
                return Err(ImageError::InvalidConfig(format!(
                    "program {i} env entry '{bad}' is not KEY=VALUE"
                )));
            }
        }
        for (i, nfs) in self.nfs.iter().enumerate() {
            if nfs.server.is_empty() || nfs.mount_point.is_empty() {
                return Err(ImageError::InvalidConfig(format!(
                    "nfs mount {i} needs both server and mount_point"
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ImageError::internal(format!("serializing VM config: {e}")))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ImageError::format(format!("config.json: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sizes_parse_with_binary_units() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("512 MiB").unwrap(), 512 << 20);
        assert_eq!(parse_size("2g").unwrap(), 2 << 30);
        assert!(parse_size("MiB").is_err());
        assert!(parse_size("12 parsecs").is_err());
    }

    #[test]
    fn disk_size_expressions() {
        assert_eq!(DiskSize::parse("auto").unwrap(), DiskSize::Auto);
        assert_eq!(DiskSize::parse("").unwrap(), DiskSize::Auto);
        assert_eq!(DiskSize::parse("1 GiB").unwrap(), DiskSize::Exact(1 << 30));
        assert_eq!(DiskSize::parse("+128M").unwrap(), DiskSize::Extra(128 << 20));
    }

    #[test]
    fn parses_full_project_file() {
        let config = VmConfig::from_toml_str(
            r#"
            [vm]
            name = "web"
            kernel = "5.10.2"
            cpus = 2
            ram = "1 GiB"
            disk_size = "+64 MiB"
            inodes = 4096

            [system]
            hostname = "web-1"

            [[program]]
            binary = "/bin/server"
            args = ["--port", "8080"]
            env = ["MODE=prod"]

            [[network]]
            ip = "dhcp"
            http = [8080]

            [[nfs]]
            server = "10.0.0.1:/export"
            mount_point = "/data"

            [[logging]]
            type = "syslog"
            config = ["host=10.0.0.2"]
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "web");
        assert_eq!(config.ram, 1 << 30);
        assert_eq!(config.disk_size, DiskSize::Extra(64 << 20));
        assert_eq!(config.inodes, 4096);
        assert_eq!(config.programs[0].args, vec!["--port", "8080"]);
        assert_eq!(config.networks[0].http, vec![8080]);
        assert_eq!(config.logging[0].kind, "syslog");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = VmConfig::from_toml_str("[vm]\nmemory = \"1G\"\n").unwrap_err();
        assert!(matches!(err, ImageError::InvalidConfig(_)));
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = VmConfig::from_toml_str("").unwrap();
        assert_eq!(config, VmConfig::default());
    }

    #[test]
    fn json_round_trip_keeps_disk_size_text() {
        let config = VmConfig {
            disk_size: DiskSize::Extra(4096),
            ..VmConfig::default()
        };
        let json = config.to_json().unwrap();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(text.contains("\"+4096\""));
        assert_eq!(VmConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn load_names_the_file_on_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[vm]\ncpus = 0\n").unwrap();
        let err = VmConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }
}
