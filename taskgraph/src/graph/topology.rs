//! Walking, validating and drawing the stage graph.

use crate::errors::{CycleDetectedError, TaskGraphError, TopologyError};
use crate::stage::Stage;
use std::collections::{HashMap, HashSet, VecDeque};

/// Returns the distinct successors of `stage`, in wiring order.
#[must_use]
pub fn successors(stage: &Stage) -> Vec<Stage> {
    let mut seen = HashSet::new();
    stage
        .next_stages()
        .into_iter()
        .filter(|next| seen.insert(next.id()))
        .collect()
}

/// Returns every stage reachable from `root`, breadth first.
#[must_use]
pub fn collect_stages(root: &Stage) -> Vec<Stage> {
    let mut seen = HashSet::from([root.id()]);
    let mut queue = VecDeque::from([root.clone()]);
    let mut stages = Vec::new();

    while let Some(stage) = queue.pop_front() {
        for next in successors(&stage) {
            if seen.insert(next.id()) {
                queue.push_back(next);
            }
        }
        stages.push(stage);
    }
    stages
}

/// Returns the tags along the first cycle found, starting and ending with the
/// same stage.
#[must_use]
pub fn find_cycle(root: &Stage) -> Option<Vec<String>> {
    fn visit(
        stage: &Stage,
        done: &mut HashSet<usize>,
        path: &mut Vec<Stage>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|s| s.ptr_eq(stage)) {
            let mut cycle: Vec<String> = path[pos..].iter().map(Stage::tag).collect();
            cycle.push(stage.tag());
            return Some(cycle);
        }
        if done.contains(&stage.id()) {
            return None;
        }

        path.push(stage.clone());
        for next in successors(stage) {
            if let Some(cycle) = visit(&next, done, path) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(stage.id());
        None
    }

    visit(root, &mut HashSet::new(), &mut Vec::new())
}

/// Number of producers feeding each stage, keyed by stage id.
#[must_use]
pub fn in_degrees(stages: &[Stage]) -> HashMap<usize, usize> {
    let mut degrees: HashMap<usize, usize> = stages.iter().map(|s| (s.id(), 0)).collect();
    for stage in stages {
        for next in successors(stage) {
            *degrees.entry(next.id()).or_default() += 1;
        }
    }
    degrees
}

/// Checks the graph and the seed tags, returning the stages breadth first.
pub fn validate<'a, I>(root: &Stage, seed_tags: I) -> Result<Vec<Stage>, TaskGraphError>
where
    I: IntoIterator<Item = &'a String>,
{
    if let Some(cycle) = find_cycle(root) {
        return Err(CycleDetectedError::new(cycle).into());
    }

    let stages = collect_stages(root);
    let mut tags = HashSet::new();
    for stage in &stages {
        let tag = stage.tag();
        if !tags.insert(tag.clone()) {
            return Err(TopologyError::duplicate_tag(&tag).into());
        }
    }

    for tag in seed_tags {
        if !tags.contains(tag) {
            return Err(TopologyError::unknown_stage(tag).into());
        }
    }
    Ok(stages)
}

fn describe(stage: &Stage) -> String {
    format!(
        "{} (stage_mode: {}, func: {})",
        stage.name(),
        stage.settings().stage_mode,
        stage.function().name()
    )
}

fn tree_lines(stage: &Stage, indent: usize, visited: &mut HashSet<usize>) -> Vec<String> {
    if !visited.insert(stage.id()) {
        return vec![format!("{} (already visited)", describe(stage))];
    }

    let mut lines = vec![describe(stage)];
    for next in successors(stage) {
        let mut sub = tree_lines(&next, indent + 2, visited).into_iter();
        let first = sub.next().unwrap_or_default();
        lines.push(format!("{}╘-->{first}", "  ".repeat(indent)));
        lines.extend(sub);
    }
    lines
}

/// Draws the graph from `root` as a boxed tree, one entry per line.
///
/// Stages reached a second time are marked `(already visited)` and not
/// expanded again.
#[must_use]
pub fn structure_lines(root: &Stage) -> Vec<String> {
    let lines = tree_lines(root, 0, &mut HashSet::new());
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    let border = format!("+{}+", "-".repeat(width + 2));

    let mut boxed = Vec::with_capacity(lines.len() + 2);
    boxed.push(border.clone());
    for line in &lines {
        let pad = width - line.chars().count();
        boxed.push(format!("| {line}{} |", " ".repeat(pad)));
    }
    boxed.push(border);
    boxed
}
