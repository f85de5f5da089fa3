//! Module hierarchy reconstructed from dotted tensor names.

use std::cmp::Ordering;
use std::collections::HashMap;

use candle_core::DType;

use super::WeightIndex;
use crate::config::ModelConfig;

/// Parents whose numbered children are transformer blocks
const LAYER_CONTAINERS: [&str; 4] = ["layers", "h", "blocks", "layer"];

const EMBEDDING_NAMES: [&str; 6] = [
    "embed_tokens",
    "wte",
    "tok_embeddings",
    "word_embeddings",
    "embeddings",
    "embed",
];
const FINAL_NORM_NAMES: [&str; 4] = ["norm", "ln_f", "final_layernorm", "final_norm"];
const HEAD_NAMES: [&str; 2] = ["lm_head", "output"];

pub const MODULE_LIST_CLASS: &str = "ModuleList";
pub const MODULE_CLASS: &str = "Module";

/// A parameter owned directly by a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Full dotted tensor name
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ModuleNode {
    /// Dotted path, empty for the root
    pub name: String,
    pub class: String,
    pub params: Vec<Param>,
    pub children: Vec<usize>,
    /// Bytes of all parameters in this subtree
    pub size: u64,
}

impl ModuleNode {
    fn new(name: String, class: String) -> Self {
        Self {
            name,
            class,
            params: Vec::new(),
            children: Vec::new(),
            size: 0,
        }
    }

    fn last_segment(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or("")
    }
}

/// Model modules in definition order: embeddings, blocks, final norm, head.
#[derive(Debug, Clone)]
pub struct ModuleTree {
    nodes: Vec<ModuleNode>,
    by_name: HashMap<String, usize>,
}

impl ModuleTree {
    /// Build the tree for a checkpoint, sizing floating point weights as `dtype`.
    pub fn from_index(index: &WeightIndex, config: &ModelConfig, dtype: DType) -> Self {
        let params = index
            .tensors()
            .iter()
            .map(|t| (t.name.clone(), t.size_as(dtype)));

        Self::from_params(params, &config.root_class(), &config.decoder_layer_class())
    }

    /// Build a tree from `(tensor name, bytes)` pairs.
    pub fn from_params(
        params: impl IntoIterator<Item = (String, u64)>,
        root_class: &str,
        layer_class: &str,
    ) -> Self {
        let mut tree = Self {
            nodes: vec![ModuleNode::new(String::new(), root_class.to_string())],
            by_name: HashMap::from([(String::new(), 0)]),
        };

        for (name, size) in params {
            let module = match name.rsplit_once('.') {
                Some((module, _)) => tree.ensure_module(module, layer_class),
                None => 0,
            };
            tree.nodes[module].params.push(Param { name, size });
        }

        tree.sort_children();
        tree.compute_sizes(0);
        tree
    }

    fn ensure_module(&mut self, path: &str, layer_class: &str) -> usize {
        if let Some(&idx) = self.by_name.get(path) {
            return idx;
        }

        let (parent, last) = match path.rsplit_once('.') {
            Some((parent, last)) => (self.ensure_module(parent, layer_class), last),
            None => (0, path),
        };

        let parent_last = self.nodes[parent].last_segment();
        let class = if last.parse::<usize>().is_ok() && LAYER_CONTAINERS.contains(&parent_last) {
            layer_class.to_string()
        } else if LAYER_CONTAINERS.contains(&last) {
            MODULE_LIST_CLASS.to_string()
        } else {
            MODULE_CLASS.to_string()
        };

        let idx = self.nodes.len();
        self.nodes.push(ModuleNode::new(path.to_string(), class));
        self.nodes[parent].children.push(idx);
        self.by_name.insert(path.to_string(), idx);
        idx
    }

    fn sort_children(&mut self) {
        for idx in 0..self.nodes.len() {
            let mut children = std::mem::take(&mut self.nodes[idx].children);
            children.sort_by(|a, b| {
                compare_segments(self.nodes[*a].last_segment(), self.nodes[*b].last_segment())
            });
            self.nodes[idx].children = children;

            self.nodes[idx]
                .params
                .sort_by(|a, b| compare_segments(&a.name, &b.name));
        }
    }

    fn compute_sizes(&mut self, idx: usize) -> u64 {
        let own: u64 = self.nodes[idx].params.iter().map(|p| p.size).sum();
        let children = self.nodes[idx].children.clone();
        let nested: u64 = children.into_iter().map(|c| self.compute_sizes(c)).sum();
        self.nodes[idx].size = own + nested;
        self.nodes[idx].size
    }

    pub fn root(&self) -> &ModuleNode {
        &self.nodes[0]
    }

    pub fn node(&self, idx: usize) -> &ModuleNode {
        &self.nodes[idx]
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn total_size(&self) -> u64 {
        self.root().size
    }

    /// Whether the module at `idx` must stay on a single device
    pub fn is_no_split(&self, idx: usize, classes: &[String]) -> bool {
        classes.iter().any(|c| *c == self.nodes[idx].class)
    }

    /// Indices of all modules whose class is in `classes`
    pub fn no_split_modules(&self, classes: &[String]) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|idx| self.is_no_split(*idx, classes))
            .collect()
    }

    /// All parameters in the subtree rooted at `idx`
    pub fn params_under(&self, idx: usize) -> Vec<&Param> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            out.extend(self.nodes[i].params.iter());
            stack.extend(self.nodes[i].children.iter().rev());
        }
        out
    }

    /// Number of decoder blocks, counted by class
    pub fn count_class(&self, class: &str) -> usize {
        self.nodes.iter().filter(|n| n.class == class).count()
    }
}

/// Definition-order rank of a top-level component
fn rank(segment: &str) -> u8 {
    if EMBEDDING_NAMES.contains(&segment) {
        0
    } else if FINAL_NORM_NAMES.contains(&segment) {
        2
    } else if HEAD_NAMES.contains(&segment) {
        3
    } else {
        1
    }
}

/// Rank first, then numbers numerically, then names lexically
fn compare_segments(a: &str, b: &str) -> Ordering {
    rank(a).cmp(&rank(b)).then_with(|| {
        match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        }
    })
}
