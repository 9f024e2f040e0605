//! Parsed pipeline step tree.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::job::Vars;

/// A runnable node of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    pub name: String,
    /// Stable path `{pipeline}/{step}`.
    pub path: String,
    pub allow_failure: bool,
    /// Runs even after a hard failure.
    pub post: bool,
    pub image: Option<String>,
    pub commands: Vec<String>,
    pub env: Vars,
}

/// Ordered step tree produced by a pipeline parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTree {
    pub name: String,
    pub env: Vars,
    pub steps: Vec<StepNode>,
}

impl NodeTree {
    pub fn get(&self, path: &str) -> Option<&StepNode> {
        self.steps.iter().find(|node| node.path == path)
    }

    pub fn first(&self) -> Option<&StepNode> {
        self.steps.first()
    }

    /// Next runnable node after `path`.
    ///
    /// On success this is the following node in tree order. On failure only
    /// nodes flagged `post` are runnable.
    pub fn next(&self, path: &str, success: bool) -> Option<&StepNode> {
        let index = self.steps.iter().position(|node| node.path == path)?;
        self.steps[index + 1..]
            .iter()
            .find(|node| success || node.post)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Turns raw pipeline text into a step tree.
pub trait PipelineParser: Send + Sync {
    fn parse(&self, source: &str) -> Result<NodeTree>;
}
