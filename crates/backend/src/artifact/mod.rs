//! Compiler artifacts: sources, ASTs and per-contract bytecode descriptors.

pub mod ast;
pub mod contract;
pub mod types;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use eyre::{bail, Result};
use foundry_compilers::artifacts::{CompilerOutput, Severity};
use itertools::Itertools;

use self::{
    ast::{AstArena, NodeIdx, NodeRef},
    contract::{BytecodeInfo, ContractRecord},
    types::TypeConverter,
};
use crate::config::DebuggerConfig;

/// Position of an artifact in load order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId(pub usize);

/// One source file (or generated source) of a compilation.
#[derive(Clone, Debug)]
pub struct SourceUnitInfo {
    pub id: usize,
    pub path: PathBuf,
    /// Root node in the owning arena, if the compiler emitted an AST.
    pub root: Option<NodeIdx>,
    pub contents: Option<Arc<str>>,
}

/// One compiler invocation's output. Immutable after load.
#[derive(Debug)]
pub struct CompiledArtifact {
    pub id: ArtifactId,
    pub compiler_version: Option<String>,
    /// File id to source unit.
    pub sources: BTreeMap<usize, SourceUnitInfo>,
    pub ast: Arc<AstArena>,
}

impl CompiledArtifact {
    /// Root node of the source unit at `path`.
    pub fn source_unit(&self, path: &Path) -> Option<NodeRef> {
        let unit = self.sources.values().find(|unit| &unit.path == path)?;
        NodeRef::new(Arc::clone(&self.ast), unit.root?)
    }
}

/// All loaded artifacts and their contracts, in load order.
#[derive(Debug)]
pub struct ArtifactIndex {
    converter: TypeConverter,
    artifacts: Vec<Arc<CompiledArtifact>>,
    contracts: Vec<Arc<ContractRecord>>,
}

impl ArtifactIndex {
    pub fn new(config: &DebuggerConfig) -> Self {
        Self {
            converter: TypeConverter::new(config.max_type_depth),
            artifacts: vec![],
            contracts: vec![],
        }
    }

    /// Loads a standard-json compiler output.
    pub fn load(
        &mut self,
        mut output: CompilerOutput,
        compiler_version: Option<String>,
    ) -> Result<ArtifactId> {
        if output.errors.iter().any(|err| err.severity == Severity::Error) {
            bail!(
                "compilation error:\n{}",
                output
                    .errors
                    .iter()
                    .filter(|err| err.severity == Severity::Error)
                    .map(|err| err.formatted_message.as_deref().unwrap_or(err.message.as_str()))
                    .join("\n\n")
            );
        }

        let id = ArtifactId(self.artifacts.len());

        let mut arena = AstArena::new();
        let mut sources = BTreeMap::new();
        for (path, source) in &output.sources {
            let root = match serde_json::to_value(&source.ast)? {
                serde_json::Value::Null => None,
                ast => arena.insert_tree(&ast),
            };
            let path = PathBuf::from(path);
            trace!(file = source.id, path = %path.display(), nodes = arena.len(), "loaded source unit");
            sources.insert(
                source.id as usize,
                SourceUnitInfo { id: source.id as usize, path, root, contents: None },
            );
        }

        let artifact = Arc::new(CompiledArtifact {
            id,
            compiler_version,
            sources,
            ast: Arc::new(arena),
        });

        let mut loaded = 0;
        for (file, contracts) in output.contracts.iter_mut() {
            let file = PathBuf::from(file);
            let unit = artifact.source_unit(&file);

            for (name, contract) in contracts.iter_mut() {
                let node = unit.as_ref().and_then(|unit| {
                    unit.sub_nodes().into_iter().find(|node| {
                        node.node_type() == "ContractDefinition" && node.name() == Some(name.as_str())
                    })
                });

                let (creation, deployed) = match contract.evm.as_mut() {
                    Some(evm) => {
                        let creation = evm
                            .bytecode
                            .as_mut()
                            .and_then(|code| BytecodeInfo::new(code, None, true));
                        let deployed = evm.deployed_bytecode.as_mut().and_then(|deployed| {
                            let immutables = deployed.immutable_references.clone();
                            deployed
                                .bytecode
                                .as_mut()
                                .and_then(|code| BytecodeInfo::new(code, Some(&immutables), false))
                        });
                        (creation, deployed)
                    }
                    None => (None, None),
                };

                if creation.is_none() && deployed.is_none() {
                    trace!(file = %file.display(), name, "skipping contract without bytecode");
                    continue;
                }

                let record = ContractRecord::new(
                    Arc::clone(&artifact),
                    file.clone(),
                    name.clone(),
                    node,
                    creation,
                    deployed,
                    &self.converter,
                );
                debug!(contract = %record, fingerprint = ?record.fingerprint(), "loaded contract");
                self.contracts.push(Arc::new(record));
                loaded += 1;
            }
        }

        debug!(artifact = id.0, contracts = loaded, "loaded compiler output");
        self.artifacts.push(artifact);
        Ok(id)
    }

    /// Parses and loads a standard-json compiler output.
    pub fn load_json(&mut self, json: &str, compiler_version: Option<String>) -> Result<ArtifactId> {
        let output: CompilerOutput = serde_json::from_str(json)?;
        self.load(output, compiler_version)
    }

    pub fn artifacts(&self) -> &[Arc<CompiledArtifact>] {
        &self.artifacts
    }

    pub fn artifact(&self, id: ArtifactId) -> Option<&Arc<CompiledArtifact>> {
        self.artifacts.get(id.0)
    }

    /// All contracts, in artifact load order.
    pub fn contracts(&self) -> &[Arc<ContractRecord>] {
        &self.contracts
    }

    /// Looks up a contract by file path and name.
    pub fn contract(&self, file: impl Into<PathBuf>, name: &str) -> Option<&Arc<ContractRecord>> {
        let file = file.into();
        self.contracts.iter().find(|record| record.file == file && record.name == name)
    }

    pub fn converter(&self) -> &TypeConverter {
        &self.converter
    }
}
