//! Structural index over mutation ids.
//!
//! A mutation description lists, per mutated source file, a tree of syntactic
//! scopes. Every scope owns the mutation ids that apply at that scope. The
//! index assigns dense node ids in pre-order and answers the ancestry
//! queries needed to decide which mutations overlap.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Identifier of one atomic source mutation.
pub type MutationId = u32;

/// Dense node identifier, assigned in pre-order.
pub type NodeId = usize;

/// Errors raised while loading or querying a mutation tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// The description could not be read.
    #[error("failed to read mutation description {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The description does not have the expected shape.
    #[error("malformed mutation description: {0}")]
    Malformed(String),
    /// The real and coverage-tracking descriptions disagree.
    #[error("mutation trees diverge: {0}")]
    Mismatch(String),
    /// Both descriptions point at the same file.
    #[error("the mutation and coverage-tracking descriptions must be different files")]
    SameDescription,
    /// Node id outside `[0, num_nodes)`.
    #[error("unknown node id {0}")]
    UnknownNode(NodeId),
    /// Mutation id not owned by any node.
    #[error("unknown mutation id {0}")]
    UnknownMutation(MutationId),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Description {
    info_for_files: Vec<FileInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileInfo {
    mutation_tree_root: JsonNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonNode {
    children: Vec<JsonNode>,
    mutation_groups: Vec<MutationGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum MutationGroup {
    ReplaceExpr(Instances),
    ReplaceBinaryOperator(Instances),
    ReplaceUnaryOperator(Instances),
    RemoveStmt(Instance),
}

#[derive(Debug, Deserialize)]
struct Instances {
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    mutation_id: MutationId,
}

impl MutationGroup {
    fn mutation_ids(&self) -> impl Iterator<Item = MutationId> + '_ {
        let instances: &[Instance] = match self {
            Self::ReplaceExpr(group)
            | Self::ReplaceBinaryOperator(group)
            | Self::ReplaceUnaryOperator(group) => &group.instances,
            Self::RemoveStmt(single) => std::slice::from_ref(single),
        };
        instances.iter().map(|instance| instance.mutation_id)
    }
}

/// One syntactic scope in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Mutation ids applying directly at this scope.
    pub mutation_ids: Vec<MutationId>,
    /// Child node ids, in document order.
    pub children: Vec<NodeId>,
}

/// Immutable forest of mutation scopes.
#[derive(Debug, Clone, Default)]
pub struct MutationTree {
    nodes: Vec<TreeNode>,
    roots: Vec<NodeId>,
    parent_map: BTreeMap<NodeId, NodeId>,
    mutation_id_to_node_id: BTreeMap<MutationId, NodeId>,
    num_mutations: usize,
}

impl MutationTree {
    /// Build the index from a JSON mutation description.
    pub fn from_json_str(json: &str) -> Result<Self, TreeError> {
        let mut de = serde_json::Deserializer::from_str(json);
        de.disable_recursion_limit();
        let description = Description::deserialize(&mut de)
            .and_then(|description| de.end().map(|()| description))
            .map_err(|err| TreeError::Malformed(err.to_string()))?;
        Ok(Self::build(description))
    }

    /// Load and build the index from a description file.
    pub fn from_path(path: &Path) -> Result<Self, TreeError> {
        let io_err = |source| TreeError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let mut de = serde_json::Deserializer::from_reader(BufReader::new(file));
        de.disable_recursion_limit();
        let description = Description::deserialize(&mut de)
            .and_then(|description| de.end().map(|()| description))
            .map_err(|err| TreeError::Malformed(format!("{}: {err}", path.display())))?;
        Ok(Self::build(description))
    }

    fn build(description: Description) -> Self {
        let mut tree = Self::default();
        for file in description.info_for_files {
            let root = tree.nodes.len();
            tree.nodes.push(TreeNode {
                mutation_ids: Vec::new(),
                children: Vec::new(),
            });
            tree.roots.push(root);
            tree.populate(file.mutation_tree_root, root);
        }
        tree
    }

    fn populate(&mut self, json: JsonNode, node_id: NodeId) {
        let mut children = Vec::with_capacity(json.children.len());
        for child in json.children {
            let child_id = self.nodes.len();
            self.nodes.push(TreeNode {
                mutation_ids: Vec::new(),
                children: Vec::new(),
            });
            self.parent_map.insert(child_id, node_id);
            children.push(child_id);
            self.populate(child, child_id);
        }

        let mutation_ids: Vec<MutationId> = json
            .mutation_groups
            .iter()
            .flat_map(MutationGroup::mutation_ids)
            .collect();
        for &id in &mutation_ids {
            self.mutation_id_to_node_id.insert(id, node_id);
            self.num_mutations = self.num_mutations.max(id as usize + 1);
        }
        self.nodes[node_id] = TreeNode {
            mutation_ids,
            children,
        };
    }

    /// Number of nodes across all files.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// One more than the largest mutation id seen.
    pub fn num_mutations(&self) -> usize {
        self.num_mutations
    }

    /// Synthetic per-file root nodes.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Node by id.
    pub fn node(&self, node_id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(node_id)
    }

    /// Parent of a node; `None` for roots.
    pub fn parent(&self, node_id: NodeId) -> Option<NodeId> {
        self.parent_map.get(&node_id).copied()
    }

    /// Node owning a mutation id.
    pub fn owner(&self, mutation_id: MutationId) -> Option<NodeId> {
        self.mutation_id_to_node_id.get(&mutation_id).copied()
    }

    /// Ids in `[0, num_mutations)` that no node owns.
    pub fn unowned_mutation_ids(&self) -> Vec<MutationId> {
        (0..self.num_mutations as MutationId)
            .filter(|id| !self.mutation_id_to_node_id.contains_key(id))
            .collect()
    }

    /// Ids owned by the node and all of its descendants.
    pub fn subtree_mutation_ids(&self, node_id: NodeId) -> Result<BTreeSet<MutationId>, TreeError> {
        let node = self.nodes.get(node_id).ok_or(TreeError::UnknownNode(node_id))?;
        let mut result: BTreeSet<MutationId> = node.mutation_ids.iter().copied().collect();
        for &child in &node.children {
            result.extend(self.subtree_mutation_ids(child)?);
        }
        Ok(result)
    }

    /// Ids that cannot be enabled together with `mutation_id`: the whole
    /// subtree of its owning node plus the direct ids of every strict
    /// ancestor. Always contains `mutation_id` itself.
    pub fn incompatible_mutation_ids(
        &self,
        mutation_id: MutationId,
    ) -> Result<BTreeSet<MutationId>, TreeError> {
        let mut node_id = self
            .owner(mutation_id)
            .ok_or(TreeError::UnknownMutation(mutation_id))?;
        let mut result = self.subtree_mutation_ids(node_id)?;
        while let Some(parent) = self.parent(node_id) {
            result.extend(self.nodes[parent].mutation_ids.iter().copied());
            node_id = parent;
        }
        Ok(result)
    }

    /// Check that `other` was produced from the same mutated sources.
    pub fn ensure_matches(&self, other: &MutationTree) -> Result<(), TreeError> {
        if self.num_nodes() != other.num_nodes() {
            return Err(TreeError::Mismatch(format!(
                "node counts differ ({} vs {})",
                self.num_nodes(),
                other.num_nodes()
            )));
        }
        if self.num_mutations != other.num_mutations {
            return Err(TreeError::Mismatch(format!(
                "mutation counts differ ({} vs {})",
                self.num_mutations, other.num_mutations
            )));
        }
        if self.parent_map != other.parent_map {
            return Err(TreeError::Mismatch("parent maps differ".to_string()));
        }
        if self.mutation_id_to_node_id != other.mutation_id_to_node_id {
            return Err(TreeError::Mismatch(
                "mutation ids are owned by different nodes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load the real and coverage-tracking descriptions and check they agree.
///
/// Returns the real tree. Any divergence is fatal for a campaign: tracked
/// ids would not refer to the mutations actually enabled.
pub fn load_matching_trees(
    mutation_info: &Path,
    tracking_info: &Path,
) -> Result<MutationTree, TreeError> {
    if mutation_info == tracking_info {
        return Err(TreeError::SameDescription);
    }
    tracing::info!(path = %mutation_info.display(), "building the real mutation tree");
    let tree = MutationTree::from_path(mutation_info)?;
    tracing::info!(path = %tracking_info.display(), "building the coverage-tracking mutation tree");
    let tracking = MutationTree::from_path(tracking_info)?;
    tree.ensure_matches(&tracking)?;

    let unowned = tree.unowned_mutation_ids();
    if !unowned.is_empty() {
        tracing::warn!(
            count = unowned.len(),
            "mutation id space has gaps; unowned ids will never be covered"
        );
    }
    tracing::info!(
        nodes = tree.num_nodes(),
        mutations = tree.num_mutations(),
        "mutation trees match"
    );
    Ok(tree)
}
