use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::Arc,
};

use alloy_primitives::{Address, Bytes, B256};
use foundry_compilers::artifacts::{Bytecode, BytecodeObject, Offsets};

use super::{
    ast::{AstArena, NodeRef, SourceRange},
    types::{event_selector, selector, TypeConverter},
    CompiledArtifact, SourceUnitInfo,
};
use crate::analysis::{
    metadata::{self, Metadata, MetadataHash},
    source_map::{SourceEntry, SourceMapIndex},
    template::BytecodeTemplate,
};

/// Compiler-generated (Yul) sources of one bytecode object.
///
/// Their file ids are only meaningful within the bytecode that produced them.
#[derive(Clone, Debug, Default)]
pub struct GeneratedSources {
    pub arena: Arc<AstArena>,
    pub files: BTreeMap<usize, SourceUnitInfo>,
}

/// Everything known about one bytecode object (creation or deployed) of a contract.
#[derive(Clone, Debug)]
pub struct BytecodeInfo {
    /// Object code with unlinked library placeholders zeroed.
    pub code: Bytes,
    pub template: BytecodeTemplate,
    pub source_map: Option<SourceMapIndex>,
    pub generated: GeneratedSources,
    pub fingerprint: Option<MetadataHash>,
}

impl BytecodeInfo {
    pub(crate) fn new(
        bytecode: &mut Bytecode,
        immutables: Option<&BTreeMap<String, Vec<Offsets>>>,
        is_creation: bool,
    ) -> Option<Self> {
        let code = link_fakely(bytecode)?;
        if code.is_empty() {
            return None;
        }

        let offsets = bytecode
            .link_references
            .values()
            .flat_map(|libraries| libraries.values())
            .chain(immutables.into_iter().flat_map(|refs| refs.values()))
            .flatten();
        let template = BytecodeTemplate::from_offsets(code.clone(), offsets);

        let source_map = bytecode.source_map.as_deref().filter(|s| !s.is_empty()).and_then(|s| {
            SourceMapIndex::new(&code, s)
                .map_err(|err| warn!(%err, "failed to parse source map"))
                .ok()
        });

        let mut generated = GeneratedSources::default();
        let mut arena = AstArena::new();
        for source in &bytecode.generated_sources {
            let root = serde_json::to_value(&source.ast)
                .ok()
                .and_then(|ast| arena.insert_tree(&ast));
            generated.files.insert(
                source.id as usize,
                SourceUnitInfo {
                    id: source.id as usize,
                    path: PathBuf::from(&source.name),
                    root,
                    contents: Some(Arc::from(source.contents.as_str())),
                },
            );
        }
        generated.arena = Arc::new(arena);

        let fingerprint = metadata::fingerprint(&code, is_creation);

        Some(Self { code, template, source_map, generated, fingerprint })
    }

    pub fn source_entry(&self, pc: usize) -> Option<SourceEntry> {
        self.source_map.as_ref()?.entry_at_pc(pc)
    }
}

/// Links every library reference against the zero address and returns the object code.
///
/// Library addresses differ per deployment; the template masks them anyway.
fn link_fakely(bytecode: &mut Bytecode) -> Option<Bytes> {
    let references: Vec<_> = bytecode
        .link_references
        .iter()
        .flat_map(|(file, libraries)| {
            libraries.iter().map(move |(library, _)| (file.clone(), library.clone()))
        })
        .collect();

    for (file, library) in references {
        bytecode.link(&file, &library, Address::ZERO);
    }

    if let Some(code) = bytecode.object.resolve() {
        return Some(Bytes::from(code.to_vec()));
    }

    // Placeholders that do not derive from the referenced library name: blank them by offset.
    let BytecodeObject::Unlinked(object) = &bytecode.object else { return None };
    let mut digits = object.strip_prefix("0x").unwrap_or(object).as_bytes().to_vec();
    for offset in bytecode.link_references.values().flat_map(|libraries| libraries.values()).flatten()
    {
        let start = offset.start as usize * 2;
        let end = start + offset.length as usize * 2;
        digits.get_mut(start..end)?.fill(b'0');
    }
    match hex::decode(&digits) {
        Ok(code) => Some(code.into()),
        Err(err) => {
            trace!(%err, "object still carries unresolved placeholders");
            None
        }
    }
}

/// How a contract is recognized on chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fingerprint {
    Hash(MetadataHash),
    Template,
}

/// One compiled contract, resolved against its artifact.
#[derive(Clone)]
pub struct ContractRecord {
    pub artifact: Arc<CompiledArtifact>,
    pub file: PathBuf,
    pub name: String,
    /// `None` when the artifact carries no AST for the contract.
    pub node: Option<NodeRef>,
    pub creation: Option<BytecodeInfo>,
    pub deployed: Option<BytecodeInfo>,
    /// Metadata decoded from the deployed code.
    pub metadata: Option<Metadata>,
    functions: Vec<([u8; 4], NodeRef)>,
    events: Vec<(B256, NodeRef)>,
    fallback: Option<NodeRef>,
    receive: Option<NodeRef>,
    constructor: Option<NodeRef>,
}

impl fmt::Debug for ContractRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractRecord")
            .field("file", &self.file)
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ContractRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.name)
    }
}

impl ContractRecord {
    pub(crate) fn new(
        artifact: Arc<CompiledArtifact>,
        file: PathBuf,
        name: String,
        node: Option<NodeRef>,
        creation: Option<BytecodeInfo>,
        deployed: Option<BytecodeInfo>,
        converter: &TypeConverter,
    ) -> Self {
        let metadata = deployed.as_ref().and_then(|code| metadata::decode(&code.code));

        let mut record = Self {
            artifact,
            file,
            name,
            node,
            creation,
            deployed,
            metadata,
            functions: vec![],
            events: vec![],
            fallback: None,
            receive: None,
            constructor: None,
        };
        record.index_entry_points(converter);
        record
    }

    fn index_entry_points(&mut self, converter: &TypeConverter) {
        // Most derived first, so overrides shadow the functions they override.
        let bases = self.bases();
        let most_derived = bases.first().cloned();
        for base in bases {
            for node in base.sub_nodes() {
                let node_type = node.node_type().to_string();
                let kind = node.function_kind().map(str::to_string);
                match (node_type.as_str(), kind.as_deref()) {
                    ("FunctionDefinition", Some("function"))
                        if matches!(node.visibility(), Some("public" | "external")) =>
                    {
                        if let Some(selector) = selector(&node, converter) {
                            self.add_function(selector, node);
                        }
                    }
                    ("FunctionDefinition", Some("fallback")) if self.fallback.is_none() => {
                        self.fallback = Some(node)
                    }
                    ("FunctionDefinition", Some("receive")) if self.receive.is_none() => {
                        self.receive = Some(node)
                    }
                    ("FunctionDefinition", Some("constructor"))
                        if Some(&base) == most_derived.as_ref() =>
                    {
                        self.constructor = Some(node)
                    }
                    ("VariableDeclaration", _) if node.is_public_state_variable() => {
                        if let Some(selector) = selector(&node, converter) {
                            self.add_function(selector, node);
                        }
                    }
                    ("EventDefinition", _) => {
                        if let Some(topic) = event_selector(&node, converter) {
                            if !self.events.iter().any(|(t, _)| *t == topic) {
                                self.events.push((topic, node));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        debug!(
            contract = %self,
            functions = self.functions.len(),
            events = self.events.len(),
            "indexed entry points"
        );
    }

    fn add_function(&mut self, selector: [u8; 4], node: NodeRef) {
        if !self.functions.iter().any(|(s, _)| *s == selector) {
            self.functions.push((selector, node));
        }
    }

    pub fn bytecode(&self, is_creation: bool) -> Option<&BytecodeInfo> {
        if is_creation {
            self.creation.as_ref()
        } else {
            self.deployed.as_ref()
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match self.deployed.as_ref().and_then(|code| code.fingerprint.clone()) {
            Some(hash) => Fingerprint::Hash(hash),
            None => Fingerprint::Template,
        }
    }

    /// Compiler version, either given at load time or read from the embedded metadata.
    pub fn compiler_version(&self) -> Option<&str> {
        self.artifact
            .compiler_version
            .as_deref()
            .or_else(|| self.metadata.as_ref()?.solc.as_deref())
    }

    pub fn source_entry(&self, pc: usize, is_creation: bool) -> Option<SourceEntry> {
        self.bytecode(is_creation)?.source_entry(pc)
    }

    /// The outermost AST node spanning exactly `range`.
    pub fn node_at(&self, range: &SourceRange, is_creation: bool) -> Option<NodeRef> {
        if let Some(code) = self.bytecode(is_creation) {
            if code.generated.files.contains_key(&range.file) {
                let idx = code.generated.arena.by_src(range)?;
                return NodeRef::new(Arc::clone(&code.generated.arena), idx);
            }
        }
        let idx = self.artifact.ast.by_src(range)?;
        NodeRef::new(Arc::clone(&self.artifact.ast), idx)
    }

    /// The contract followed by its base contracts, most derived first.
    pub fn bases(&self) -> Vec<NodeRef> {
        self.node.as_ref().map(NodeRef::linearized_bases).unwrap_or_default()
    }

    /// Function or public getter dispatched for the given call data.
    ///
    /// Falls back to `receive` for empty input and to `fallback` for unknown selectors.
    pub fn entry_point(&self, input: &[u8]) -> Option<NodeRef> {
        if input.is_empty() {
            return self.receive.clone().or_else(|| self.fallback.clone());
        }
        if input.len() >= 4 {
            let selector = [input[0], input[1], input[2], input[3]];
            if let Some((_, node)) = self.functions.iter().find(|(s, _)| *s == selector) {
                return Some(node.clone());
            }
        }
        self.fallback.clone()
    }

    pub fn function_by_selector(&self, selector: [u8; 4]) -> Option<&NodeRef> {
        self.functions.iter().find(|(s, _)| *s == selector).map(|(_, node)| node)
    }

    pub fn constructor(&self) -> Option<&NodeRef> {
        self.constructor.as_ref()
    }

    pub fn event(&self, topic0: &B256) -> Option<&NodeRef> {
        self.events.iter().find(|(s, _)| s == topic0).map(|(_, node)| node)
    }

    /// State variables in storage layout order (most base contract first).
    pub fn state_variables(&self) -> Vec<NodeRef> {
        self.bases()
            .into_iter()
            .rev()
            .flat_map(|base| base.sub_nodes())
            .filter(|node| {
                node.node_type() == "VariableDeclaration" &&
                    node.attr_bool("stateVariable") == Some(true)
            })
            .collect()
    }
}
