//! A flattened, read-only view of compiler ASTs.
//!
//! Solidity and Yul ASTs change shape between compiler versions, so rather than binding to a
//! typed schema we walk the JSON form and keep every object carrying a `nodeType` as a node.
//! Everything else stays as raw JSON attributes on the owning node.

use std::{fmt, sync::Arc};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Index of a node inside an [`AstArena`].
pub type NodeIdx = usize;

/// A `start:length:file` triple, as used by both ASTs and source maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRange {
    pub start: usize,
    pub length: usize,
    pub file: usize,
}

impl SourceRange {
    pub fn new(start: usize, length: usize, file: usize) -> Self {
        Self { start, length, file }
    }

    /// Parses `start:length:file`. A negative file index means "no source".
    pub fn parse(src: &str) -> Option<Self> {
        let mut parts = src.split(':');
        let start = parts.next()?.parse().ok()?;
        let length = parts.next()?.parse().ok()?;
        let file: i64 = parts.next()?.parse().ok()?;
        if file < 0 {
            return None;
        }
        Some(Self { start, length, file: file as usize })
    }

    /// End offset (exclusive).
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    /// Whether `other` lies within this range of the same file.
    pub fn contains(&self, other: &Self) -> bool {
        self.file == other.file && self.start <= other.start && other.end() <= self.end()
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.length, self.file)
    }
}

/// One AST node.
#[derive(Clone, Debug)]
pub struct AstNode {
    pub id: Option<usize>,
    pub node_type: String,
    pub src: Option<SourceRange>,
    pub parent: Option<NodeIdx>,
    /// Non-node JSON fields, e.g. `name`, `typeDescriptions`, `functionSelector`.
    pub attributes: Map<String, JsonValue>,
    /// Child nodes tagged with the JSON field they were found under.
    pub children: Vec<(String, NodeIdx)>,
}

/// Arena of flattened AST nodes for one compilation (or one set of generated sources).
#[derive(Clone, Debug, Default)]
pub struct AstArena {
    nodes: Vec<AstNode>,
    by_id: FxHashMap<usize, NodeIdx>,
    by_src: FxHashMap<SourceRange, NodeIdx>,
}

impl AstArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flattens a JSON AST into the arena and returns the index of its root.
    pub fn insert_tree(&mut self, json: &JsonValue) -> Option<NodeIdx> {
        let object = json.as_object()?;
        object.get("nodeType")?.as_str()?;
        Some(self.insert_node(object, None))
    }

    fn insert_node(&mut self, object: &Map<String, JsonValue>, parent: Option<NodeIdx>) -> NodeIdx {
        let idx = self.nodes.len();

        let node_type =
            object.get("nodeType").and_then(JsonValue::as_str).unwrap_or_default().to_string();
        let id = object.get("id").and_then(JsonValue::as_u64).map(|id| id as usize);
        let src = object.get("src").and_then(JsonValue::as_str).and_then(SourceRange::parse);

        self.nodes.push(AstNode {
            id,
            node_type,
            src,
            parent,
            attributes: Map::new(),
            children: Vec::new(),
        });
        if let Some(id) = id {
            self.by_id.insert(id, idx);
        }
        if let Some(src) = src {
            // Nodes are inserted in pre-order, so the outermost node for a range stays.
            self.by_src.entry(src).or_insert(idx);
        }

        for (field, value) in object {
            if matches!(field.as_str(), "nodeType" | "id" | "src") {
                continue;
            }

            match value {
                JsonValue::Object(child) if is_node(child) => {
                    let child = self.insert_node(child, Some(idx));
                    self.nodes[idx].children.push((field.clone(), child));
                }
                JsonValue::Array(items) if items.iter().any(is_node_value) => {
                    for item in items {
                        if let JsonValue::Object(child) = item {
                            if is_node(child) {
                                let child = self.insert_node(child, Some(idx));
                                self.nodes[idx].children.push((field.clone(), child));
                            }
                        }
                    }
                }
                _ => {
                    self.nodes[idx].attributes.insert(field.clone(), value.clone());
                }
            }
        }

        idx
    }

    pub fn get(&self, idx: NodeIdx) -> Option<&AstNode> {
        self.nodes.get(idx)
    }

    pub fn by_id(&self, id: usize) -> Option<NodeIdx> {
        self.by_id.get(&id).copied()
    }

    pub fn by_src(&self, src: &SourceRange) -> Option<NodeIdx> {
        self.by_src.get(src).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn is_node(object: &Map<String, JsonValue>) -> bool {
    object.get("nodeType").is_some_and(JsonValue::is_string)
}

fn is_node_value(value: &JsonValue) -> bool {
    value.as_object().is_some_and(is_node)
}

/// A shareable handle to one node of an arena.
///
/// Two handles are equal only if they point at the same node of the same arena.
#[derive(Clone)]
pub struct NodeRef {
    arena: Arc<AstArena>,
    idx: NodeIdx,
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx && Arc::ptr_eq(&self.arena, &other.arena)
    }
}

impl Eq for NodeRef {}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("NodeRef");
        s.field("node_type", &self.node_type());
        if let Some(name) = self.name() {
            s.field("name", &name);
        }
        if let Some(id) = self.id() {
            s.field("id", &id);
        }
        s.finish()
    }
}

impl NodeRef {
    /// Creates a handle, checking that `idx` exists.
    pub fn new(arena: Arc<AstArena>, idx: NodeIdx) -> Option<Self> {
        (idx < arena.len()).then_some(Self { arena, idx })
    }

    fn at(&self, idx: NodeIdx) -> Self {
        Self { arena: Arc::clone(&self.arena), idx }
    }

    fn node(&self) -> &AstNode {
        // The index was checked on construction and arenas never shrink.
        &self.arena.nodes[self.idx]
    }

    pub fn idx(&self) -> NodeIdx {
        self.idx
    }

    pub fn arena(&self) -> &Arc<AstArena> {
        &self.arena
    }

    pub fn id(&self) -> Option<usize> {
        self.node().id
    }

    pub fn node_type(&self) -> &str {
        &self.node().node_type
    }

    pub fn src(&self) -> Option<SourceRange> {
        self.node().src
    }

    pub fn parent(&self) -> Option<Self> {
        self.node().parent.map(|idx| self.at(idx))
    }

    pub fn attr(&self, key: &str) -> Option<&JsonValue> {
        self.node().attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attr(key).and_then(JsonValue::as_str)
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attr(key).and_then(JsonValue::as_bool)
    }

    pub fn name(&self) -> Option<&str> {
        self.attr_str("name").filter(|name| !name.is_empty())
    }

    /// First child found under `field`.
    pub fn child(&self, field: &str) -> Option<Self> {
        self.node().children.iter().find(|(f, _)| f == field).map(|(_, idx)| self.at(*idx))
    }

    /// All children found under `field`, in source order.
    pub fn children<'a>(&'a self, field: &'a str) -> impl Iterator<Item = Self> + 'a {
        self.node().children.iter().filter(move |(f, _)| f == field).map(|(_, idx)| self.at(*idx))
    }

    /// Looks up another node of the same arena by its AST id.
    pub fn resolve(&self, id: usize) -> Option<Self> {
        self.arena.by_id(id).map(|idx| self.at(idx))
    }

    /// Follows `referencedDeclaration`.
    pub fn referenced_declaration(&self) -> Option<Self> {
        let id = self.attr("referencedDeclaration")?.as_i64()?;
        if id < 0 {
            return None;
        }
        self.resolve(id as usize)
    }

    /// Closest ancestor (or self) of the given node type.
    pub fn ancestor(&self, node_type: &str) -> Option<Self> {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if node.node_type() == node_type {
                return Some(node);
            }
            current = node.parent();
        }
        None
    }

    /// `linearizedBaseContracts` of a contract definition, most derived first.
    pub fn linearized_bases(&self) -> Vec<Self> {
        let Some(ids) = self.attr("linearizedBaseContracts").and_then(JsonValue::as_array) else {
            return vec![self.clone()];
        };
        ids.iter()
            .filter_map(JsonValue::as_u64)
            .filter_map(|id| self.resolve(id as usize))
            .collect()
    }

    /// Formal parameters of a function, modifier or event.
    pub fn parameters(&self) -> Vec<Self> {
        self.child("parameters")
            .map(|list| list.children("parameters").collect())
            .unwrap_or_default()
    }

    /// Return parameters of a function.
    pub fn return_parameters(&self) -> Vec<Self> {
        self.child("returnParameters")
            .map(|list| list.children("parameters").collect())
            .unwrap_or_default()
    }

    /// Members of a struct or enum definition.
    pub fn members(&self) -> Vec<Self> {
        self.children("members").collect()
    }

    /// Declarations directly inside a contract or source unit.
    pub fn sub_nodes(&self) -> Vec<Self> {
        self.children("nodes").collect()
    }

    /// The 4-byte selector recorded by the compiler, if any.
    pub fn function_selector(&self) -> Option<[u8; 4]> {
        let selector = self.attr_str("functionSelector")?;
        let bytes = hex::decode(selector).ok()?;
        bytes.try_into().ok()
    }

    /// `FunctionDefinition` kind (`function`, `constructor`, `fallback`, `receive`, ...).
    pub fn function_kind(&self) -> Option<&str> {
        if self.node_type() != "FunctionDefinition" {
            return None;
        }
        // Old compilers use `isConstructor` and an empty name for the fallback.
        match self.attr_str("kind") {
            Some(kind) => Some(kind),
            None if self.attr_bool("isConstructor") == Some(true) => Some("constructor"),
            None if self.name().is_none() => Some("fallback"),
            None => Some("function"),
        }
    }

    pub fn visibility(&self) -> Option<&str> {
        self.attr_str("visibility")
    }

    /// A state variable with an auto-generated getter.
    pub fn is_public_state_variable(&self) -> bool {
        self.node_type() == "VariableDeclaration" &&
            self.attr_bool("stateVariable") == Some(true) &&
            self.visibility() == Some("public")
    }

    /// A function definition or a public state variable: something that can own a frame.
    pub fn is_callable(&self) -> bool {
        self.node_type() == "FunctionDefinition" || self.is_public_state_variable()
    }

    /// Constant or immutable state variables occupy no storage.
    pub fn is_storage_less(&self) -> bool {
        self.attr_bool("constant") == Some(true) ||
            matches!(self.attr_str("mutability"), Some("constant" | "immutable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arena() -> (Arc<AstArena>, NodeIdx) {
        let ast = json!({
            "nodeType": "SourceUnit",
            "id": 10,
            "src": "0:100:0",
            "absolutePath": "A.sol",
            "nodes": [{
                "nodeType": "ContractDefinition",
                "id": 9,
                "src": "0:100:0",
                "name": "A",
                "linearizedBaseContracts": [9],
                "nodes": [{
                    "nodeType": "FunctionDefinition",
                    "id": 8,
                    "src": "20:50:0",
                    "name": "f",
                    "kind": "function",
                    "functionSelector": "b3de648b",
                    "parameters": {
                        "nodeType": "ParameterList",
                        "id": 5,
                        "src": "30:10:0",
                        "parameters": [{
                            "nodeType": "VariableDeclaration",
                            "id": 4,
                            "src": "31:9:0",
                            "name": "x",
                            "typeName": { "nodeType": "ElementaryTypeName", "id": 3, "src": "31:7:0", "name": "uint256" }
                        }]
                    },
                    "returnParameters": { "nodeType": "ParameterList", "id": 6, "src": "41:0:0", "parameters": [] },
                    "body": { "nodeType": "Block", "id": 7, "src": "42:28:0", "statements": [] }
                }]
            }]
        });
        let mut arena = AstArena::new();
        let root = arena.insert_tree(&ast).unwrap();
        (Arc::new(arena), root)
    }

    #[test]
    fn test_flatten_and_navigate() {
        let (arena, root) = arena();
        assert_eq!(arena.len(), 8);

        let unit = NodeRef::new(Arc::clone(&arena), root).unwrap();
        let contract = unit.sub_nodes().pop().unwrap();
        assert_eq!(contract.name(), Some("A"));
        assert_eq!(contract.linearized_bases(), vec![contract.clone()]);

        let function = contract.sub_nodes().pop().unwrap();
        assert!(function.is_callable());
        assert_eq!(function.function_kind(), Some("function"));
        assert_eq!(function.function_selector(), Some([0xb3, 0xde, 0x64, 0x8b]));
        assert_eq!(function.parameters().len(), 1);
        assert!(function.return_parameters().is_empty());
        assert_eq!(function.parameters()[0].ancestor("ContractDefinition"), Some(contract));
    }

    #[test]
    fn test_outermost_node_wins_for_source_range() {
        let (arena, _) = arena();
        let idx = arena.by_src(&SourceRange::new(0, 100, 0)).unwrap();
        assert_eq!(arena.get(idx).unwrap().node_type, "SourceUnit");
        assert_eq!(SourceRange::parse("1:2:-1"), None);
        assert_eq!(SourceRange::parse("1:2:3"), Some(SourceRange::new(1, 2, 3)));
    }
}
