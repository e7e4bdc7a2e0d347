use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use ringwatch_core::MembershipConfig;
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Everything the CLI reads from its configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Settings handed to every simulated silo.
    pub membership: MembershipConfig,
    /// Shape of the simulated cluster.
    pub simulation: SimulationConfig,
}

impl CliConfig {
    /// Parses the defaults shipped with the binary.
    ///
    /// # Errors
    ///
    /// Fails only if the bundled file is malformed.
    pub fn bundled() -> Result<Self> {
        toml::from_str(DEFAULT_CONFIG).context("bundled default config is invalid")
    }

    /// Checks settings that would make a simulation meaningless.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.membership.validate()?;
        if self.simulation.silos < 2 {
            bail!("simulation.silos must be at least 2, got {}", self.simulation.silos);
        }
        Ok(())
    }
}

/// How simulated silos talk to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process channels.
    Local,
    /// Bincode datagrams on loopback.
    Udp,
}

/// Shape and deadlines of a simulated cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of silos started.
    pub silos: u16,
    /// Loopback port of the first silo; the rest follow consecutively.
    pub base_port: u16,
    /// Transport between silos.
    pub transport: TransportKind,
    /// How long the cluster may take to agree that every silo is Active.
    #[serde(with = "humantime_serde")]
    pub settle_timeout: Duration,
    /// How long the survivors may take to declare the killed silo Dead.
    #[serde(with = "humantime_serde")]
    pub detection_timeout: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            silos: 3,
            base_port: 41_000,
            transport: TransportKind::Local,
            settle_timeout: Duration::from_secs(30),
            detection_timeout: Duration::from_secs(60),
        }
    }
}

/// Loads, edits and persists the CLI configuration file.
///
/// The user file is layered over the bundled defaults key by key, so it only
/// needs the settings it changes.
pub struct ConfigManager {
    path: PathBuf,
    config: CliConfig,
}

impl ConfigManager {
    /// Loads from the per-user configuration directory.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be determined or the file is invalid.
    pub fn load() -> Result<Self> {
        let path = default_config_path()?;
        Self::load_with_path(path)
    }

    /// Loads from `path`, falling back to the defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, does not parse, or holds invalid
    /// settings.
    pub fn load_with_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut layered: Table =
            toml::from_str(DEFAULT_CONFIG).context("bundled default config is invalid")?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            let user: Table = toml::from_str(&contents)
                .with_context(|| format!("invalid config at {}", path.display()))?;
            merge_tables(&mut layered, user);
        }

        let config: CliConfig = Value::Table(layered)
            .try_into()
            .with_context(|| format!("invalid config at {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        Ok(Self { path, config })
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &CliConfig {
        &self.config
    }

    /// File this manager reads and writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the effective configuration back to [`path`](Self::path).
    ///
    /// # Errors
    ///
    /// Fails when the directory or file cannot be written.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let toml = self.render()?;
        fs::write(&self.path, toml)
            .with_context(|| format!("failed to write config to {}", self.path.display()))?;
        Ok(())
    }

    /// Effective configuration as TOML, optionally narrowed to one section.
    ///
    /// # Errors
    ///
    /// Fails for an unknown section.
    pub fn render_section(&self, section: Option<&str>) -> Result<String> {
        let Some(section) = section else {
            return self.render();
        };
        let value = self
            .lookup(section)?
            .ok_or_else(|| anyhow!("unknown configuration section: {section}"))?;
        match value {
            Value::Table(table) => Ok(toml::to_string_pretty(&table)?),
            other => Ok(format!("{section} = {other}\n")),
        }
    }

    /// Reads one dotted key such as `membership.probe.interval`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match self.lookup(key).ok().flatten()? {
            Value::String(text) => Some(text),
            Value::Table(_) => None,
            other => Some(other.to_string()),
        }
    }

    /// Sets one dotted key, parsing `value` like the current value's type.
    ///
    /// # Errors
    ///
    /// Fails for unknown keys, unparsable values, or a result that does not
    /// validate; the configuration is left unchanged on failure.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut root = self.as_table()?;
        let (parents, leaf) = match key.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, key),
        };

        let mut table = &mut root;
        for segment in parents.into_iter().flat_map(|path| path.split('.')) {
            table = match table.get_mut(segment) {
                Some(Value::Table(inner)) => inner,
                _ => bail!("unknown configuration key: {key}"),
            };
        }
        let current = table
            .get(leaf)
            .ok_or_else(|| anyhow!("unknown configuration key: {key}"))?;
        let parsed = parse_like(current, value).with_context(|| format!("invalid value for {key}"))?;
        table.insert(leaf.to_string(), parsed);

        let updated: CliConfig = Value::Table(root)
            .try_into()
            .with_context(|| format!("invalid value for {key}"))?;
        updated.validate()?;
        self.config = updated;
        Ok(())
    }

    fn render(&self) -> Result<String> {
        Ok(toml::to_string_pretty(&self.config)?)
    }

    fn as_table(&self) -> Result<Table> {
        match Value::try_from(&self.config)? {
            Value::Table(table) => Ok(table),
            _ => bail!("configuration did not serialize to a table"),
        }
    }

    fn lookup(&self, key: &str) -> Result<Option<Value>> {
        let mut value = Value::Table(self.as_table()?);
        for segment in key.split('.') {
            let Value::Table(mut table) = value else {
                return Ok(None);
            };
            let Some(next) = table.remove(segment) else {
                return Ok(None);
            };
            value = next;
        }
        Ok(Some(value))
    }
}

/// Overlays `overlay` onto `base`, descending into tables present in both.
fn merge_tables(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_like(current: &Value, raw: &str) -> Result<Value> {
    let parsed = match current {
        Value::Boolean(_) => Value::Boolean(parse_bool(raw)?),
        Value::Integer(_) => Value::Integer(raw.trim().parse()?),
        Value::Float(_) => Value::Float(raw.trim().parse()?),
        Value::String(_) => Value::String(raw.to_string()),
        _ => bail!("only scalar settings can be set"),
    };
    Ok(parsed)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("expected boolean value, received '{value}'")),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base =
        dirs::config_dir().ok_or_else(|| anyhow!("unable to determine configuration directory"))?;
    Ok(base.join("ringwatch").join("config.toml"))
}
