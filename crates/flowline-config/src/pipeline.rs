//! Pipeline definition parsing.

use flowline_core::job::Vars;
use flowline_core::pipeline::{NodeTree, PipelineParser, StepNode};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashSet;

use crate::node::{get_bool_prop, get_first_string_arg, get_vars};
use crate::{ConfigError, ConfigResult};

/// Parse a pipeline definition from KDL text into its step tree.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<NodeTree> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut env = Vars::new();
    let mut step_nodes = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "env" => env.extend(get_vars(node)),
            "step" => step_nodes.push(node),
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(step_nodes.len());
    for node in step_nodes {
        let step = parse_step(&name, node)?;
        if !seen.insert(step.name.clone()) {
            return Err(ConfigError::Duplicate(format!("step '{}'", step.name)));
        }
        steps.push(step);
    }

    if steps.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "steps for pipeline '{}'",
            name
        )));
    }

    Ok(NodeTree { name, env, steps })
}

fn parse_step(pipeline: &str, node: &KdlNode) -> ConfigResult<StepNode> {
    let name = get_first_string_arg(node)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ConfigError::MissingField("step name".to_string()))?;

    let mut image = None;
    let mut commands = Vec::new();
    let mut env = Vars::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => image = get_first_string_arg(child),
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "env" => env.extend(get_vars(child)),
                _ => {}
            }
        }
    }

    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run for step '{}'",
            name
        )));
    }

    Ok(StepNode {
        path: format!("{}/{}", pipeline, name),
        name,
        allow_failure: get_bool_prop(node, "allow-failure").unwrap_or(false),
        post: get_bool_prop(node, "post").unwrap_or(false),
        image,
        commands,
        env,
    })
}

/// [`PipelineParser`] backed by the KDL pipeline format.
#[derive(Debug, Clone, Copy, Default)]
pub struct KdlPipelineParser;

impl PipelineParser for KdlPipelineParser {
    fn parse(&self, source: &str) -> flowline_core::Result<NodeTree> {
        Ok(parse_pipeline(source)?)
    }
}
