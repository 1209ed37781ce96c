//! Static connector registry.
//!
//! Maps a lower-case connector identifier to a constructor, per role.
//! [`ConnectorRegistry::builtin`] knows every connector shipped in this
//! crate; embedders can [`register_source`](ConnectorRegistry::register_source)
//! (and friends) their own before handing the registry to the CLI or the
//! orchestrator.
//!
//! ```rust
//! use dat::registry::{ConnectorRegistry, Role};
//!
//! let registry = ConnectorRegistry::builtin();
//! assert!(registry.source("Filesystem").is_ok());
//! assert!(registry.names(Role::Generator).contains(&"hash"));
//! ```

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use dat_core::generator::Generator;
use dat_core::loader::Destination;
use dat_core::protocol::ConnectorSpecification;
use dat_core::source::Source;

use crate::connector_fs::FilesystemSource;
use crate::embedding::EmbeddingGenerator;
use crate::sqlite_loader::SqliteDestination;

pub type SourceCtor = fn() -> Arc<dyn Source>;
pub type GeneratorCtor = fn() -> Arc<dyn Generator>;
pub type DestinationCtor = fn() -> Arc<dyn Destination>;

/// Pipeline position of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Source,
    Generator,
    Destination,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Generator => "generator",
            Role::Destination => "destination",
        }
    }
}

/// Registry of connector constructors, keyed by lower-case name.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    sources: BTreeMap<String, SourceCtor>,
    generators: BTreeMap<String, GeneratorCtor>,
    destinations: BTreeMap<String, DestinationCtor>,
}

impl ConnectorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in connector.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_source("filesystem", || Arc::new(FilesystemSource::new()));
        registry.register_generator("openai", || Arc::new(EmbeddingGenerator::openai()));
        registry.register_generator("ollama", || Arc::new(EmbeddingGenerator::ollama()));
        registry.register_generator("hash", || Arc::new(EmbeddingGenerator::hash()));
        registry.register_destination("sqlite", || Arc::new(SqliteDestination::new()));
        registry
    }

    pub fn register_source(&mut self, name: &str, ctor: SourceCtor) {
        self.sources.insert(name.to_ascii_lowercase(), ctor);
    }

    pub fn register_generator(&mut self, name: &str, ctor: GeneratorCtor) {
        self.generators.insert(name.to_ascii_lowercase(), ctor);
    }

    pub fn register_destination(&mut self, name: &str, ctor: DestinationCtor) {
        self.destinations.insert(name.to_ascii_lowercase(), ctor);
    }

    pub fn source(&self, name: &str) -> Result<Arc<dyn Source>> {
        lookup(&self.sources, Role::Source, name).map(|ctor| ctor())
    }

    pub fn generator(&self, name: &str) -> Result<Arc<dyn Generator>> {
        lookup(&self.generators, Role::Generator, name).map(|ctor| ctor())
    }

    pub fn destination(&self, name: &str) -> Result<Arc<dyn Destination>> {
        lookup(&self.destinations, Role::Destination, name).map(|ctor| ctor())
    }

    /// Registered names for `role`, sorted.
    pub fn names(&self, role: Role) -> Vec<&str> {
        match role {
            Role::Source => self.sources.keys().map(String::as_str).collect(),
            Role::Generator => self.generators.keys().map(String::as_str).collect(),
            Role::Destination => self.destinations.keys().map(String::as_str).collect(),
        }
    }

    /// The specification of `name` under `role`.
    pub fn spec(&self, role: Role, name: &str) -> Result<ConnectorSpecification> {
        Ok(match role {
            Role::Source => self.source(name)?.spec(),
            Role::Generator => self.generator(name)?.spec(),
            Role::Destination => self.destination(name)?.spec(),
        })
    }

    /// Find `name` under any role, sources first.
    pub fn find_spec(&self, name: &str) -> Result<(Role, ConnectorSpecification)> {
        for role in [Role::Source, Role::Generator, Role::Destination] {
            if let Ok(spec) = self.spec(role, name) {
                return Ok((role, spec));
            }
        }
        Err(anyhow!(
            "Unknown connector '{}'. Run `dat connectors` to list available connectors.",
            name
        ))
    }
}

fn lookup<T: Copy>(map: &BTreeMap<String, T>, role: Role, name: &str) -> Result<T> {
    map.get(&name.to_ascii_lowercase()).copied().ok_or_else(|| {
        let known: Vec<&str> = map.keys().map(String::as_str).collect();
        anyhow!(
            "Unknown {} connector '{}' (available: {})",
            role.as_str(),
            name,
            known.join(", ")
        )
    })
}
