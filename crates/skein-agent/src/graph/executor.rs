use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use futures::future::try_join_all;
use tracing::{debug, error, info};

use skein_core::error::{Result, SkeinError};

use super::builder::{END, START};
use super::edge::Successors;
use super::node::Node;
use super::value::{Value, ValueKind};

/// Result of executing a single node.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_id: String,
    /// Stringified node output.
    pub output: String,
    pub elapsed_ms: u64,
}

/// Result of one graph invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The value delivered to `end`.
    pub output: Value,
    /// Per-node results in visitation order.
    pub node_results: Vec<NodeResult>,
    pub total_elapsed_ms: u64,
}

impl ExecutionResult {
    /// Ids of the nodes that ran, in visitation order.
    pub fn visited(&self) -> Vec<&str> {
        self.node_results.iter().map(|r| r.node_id.as_str()).collect()
    }
}

/// A validated, immutable workflow graph.
///
/// Nodes are grouped into levels by longest distance from `start`. A level
/// runs only after every earlier level has finished, and the activated nodes
/// inside a level run concurrently. Invocations share nothing but the graph,
/// so one `CompiledGraph` can serve many callers at once.
pub struct CompiledGraph {
    input: ValueKind,
    output: ValueKind,
    nodes: HashMap<String, Node>,
    successors: HashMap<String, Successors>,
    levels: Vec<Vec<String>>,
}

// Values waiting for a node, tagged with the sender's label.
type Inbox = HashMap<String, Vec<(String, Value)>>;

impl CompiledGraph {
    pub(crate) fn new(
        input: ValueKind,
        output: ValueKind,
        nodes: Vec<Node>,
        successors: HashMap<String, Successors>,
        levels: Vec<Vec<String>>,
    ) -> Self {
        Self {
            input,
            output,
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            successors,
            levels,
        }
    }

    /// Node ids grouped by execution level.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Run the graph and return the value bound to `end`.
    pub async fn invoke(&self, input: Value) -> Result<Value> {
        Ok(self.invoke_traced(input).await?.output)
    }

    /// Run the graph, keeping per-node timing.
    ///
    /// Any node failure aborts the invocation; no partial result is returned.
    pub async fn invoke_traced(&self, input: Value) -> Result<ExecutionResult> {
        let started = Instant::now();

        if !self.input.accepts(input.kind()) {
            return Err(SkeinError::ContractViolation {
                node: START.to_string(),
                expected: self.input.to_string(),
                found: input.kind().to_string(),
            });
        }

        let mut inbox = Inbox::new();
        self.dispatch(START, START, input, &mut inbox)?;

        let mut node_results = Vec::new();
        for level in &self.levels {
            let ready: Vec<(&Node, Vec<(String, Value)>)> = level
                .iter()
                .filter_map(|id| {
                    let inputs = inbox.remove(id)?;
                    self.nodes.get(id).map(|node| (node, inputs))
                })
                .collect();
            if ready.is_empty() {
                continue;
            }

            let runs = ready
                .into_iter()
                .map(|(node, inputs)| self.run_node(node, inputs));
            for (node, output, elapsed_ms) in try_join_all(runs).await? {
                node_results.push(NodeResult {
                    node_id: node.id.clone(),
                    output: output.to_string(),
                    elapsed_ms,
                });
                self.dispatch(&node.id, &node.label, output, &mut inbox)?;
            }
        }

        let mut arrivals = inbox.remove(END).unwrap_or_default();
        let output = match arrivals.len() {
            0 => return Err(SkeinError::EndNotReached),
            1 => arrivals.remove(0).1,
            _ => return Err(SkeinError::ConflictingInputs(END.to_string())),
        };
        if !self.output.accepts(output.kind()) {
            return Err(SkeinError::ContractViolation {
                node: END.to_string(),
                expected: self.output.to_string(),
                found: output.kind().to_string(),
            });
        }

        let total_elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            nodes_run = node_results.len(),
            total_elapsed_ms,
            "Graph invocation complete"
        );

        Ok(ExecutionResult {
            output,
            node_results,
            total_elapsed_ms,
        })
    }

    async fn run_node<'a>(
        &self,
        node: &'a Node,
        inputs: Vec<(String, Value)>,
    ) -> Result<(&'a Node, Value, u64)> {
        let input = gather(node, inputs)?;

        info!(node_id = %node.id, kind = ?node.kind, "Executing graph node");
        let started = Instant::now();
        let output = node.run(input).await.map_err(|e| {
            error!(node_id = %node.id, error = %e, "Graph node failed");
            e
        })?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !node.output.accepts(output.kind()) {
            return Err(SkeinError::ContractViolation {
                node: node.id.clone(),
                expected: node.output.to_string(),
                found: output.kind().to_string(),
            });
        }

        debug!(node_id = %node.id, elapsed_ms, "Node execution complete");
        Ok((node, output, elapsed_ms))
    }

    /// Hand `value` to the successors of `from`.
    fn dispatch(&self, from: &str, label: &str, value: Value, inbox: &mut Inbox) -> Result<()> {
        match self.successors.get(from) {
            None => {}
            Some(Successors::Edges(targets)) => {
                for to in targets {
                    inbox
                        .entry(to.clone())
                        .or_default()
                        .push((label.to_string(), value.clone()));
                }
            }
            Some(Successors::Branch(branch)) => {
                let target = branch.resolve(from, &value)?;
                info!(branch = %branch.name, from, target = %target, "Branch resolved");
                inbox
                    .entry(target)
                    .or_default()
                    .push((label.to_string(), value));
            }
        }
        Ok(())
    }
}

/// Build a node's input from whatever its predecessors delivered.
///
/// Fan-in nodes get a label-keyed mapping; any other node must receive
/// exactly one value of its declared kind.
fn gather(node: &Node, mut inputs: Vec<(String, Value)>) -> Result<Value> {
    if node.input == ValueKind::Merged {
        let merged: BTreeMap<String, Value> = inputs.into_iter().collect();
        return Ok(Value::Merged(merged));
    }
    if inputs.len() > 1 {
        return Err(SkeinError::ConflictingInputs(node.id.clone()));
    }
    let (_, value) = inputs
        .pop()
        .ok_or_else(|| SkeinError::ConflictingInputs(node.id.clone()))?;
    if !node.input.accepts(value.kind()) {
        return Err(SkeinError::ContractViolation {
            node: node.id.clone(),
            expected: node.input.to_string(),
            found: value.kind().to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::graph::{Branch, Graph};
    use skein_core::types::Judgment;

    fn upper(id: &str) -> Node {
        Node::transform(id, ValueKind::Text, ValueKind::Text, |v| {
            Ok(Value::text(v.to_string().to_uppercase()))
        })
    }

    fn suffix(id: &str, s: &'static str) -> Node {
        Node::transform(id, ValueKind::Text, ValueKind::Text, move |v| {
            Ok(Value::text(format!("{}{}", v, s)))
        })
    }

    fn classify() -> Node {
        Node::transform("classify", ValueKind::Text, ValueKind::Judgment, |v| {
            Ok(Value::Judgment(
                Judgment::parse(&v.to_string()).unwrap_or_default(),
            ))
        })
    }

    fn branching_graph() -> CompiledGraph {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(classify()).unwrap();
        g.add_node(Node::notice("a", ValueKind::Judgment, "A:{description}"))
            .unwrap();
        g.add_node(Node::notice("b", ValueKind::Judgment, "B:{description}"))
            .unwrap();
        g.add_edge(START, "classify").unwrap();
        g.add_branch("classify", Branch::on_flag("flagged", "a", "b"))
            .unwrap();
        g.add_edge("a", END).unwrap();
        g.add_edge("b", END).unwrap();
        g.compile().unwrap()
    }

    #[tokio::test]
    async fn test_linear_invoke() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(upper("up")).unwrap();
        g.add_node(suffix("bang", "!")).unwrap();
        g.add_edge(START, "up").unwrap();
        g.add_edge("up", "bang").unwrap();
        g.add_edge("bang", END).unwrap();
        let compiled = g.compile().unwrap();

        let result = compiled.invoke_traced(Value::text("hi")).await.unwrap();
        assert_eq!(result.output, Value::text("HI!"));
        assert_eq!(result.visited(), vec!["up", "bang"]);
    }

    #[tokio::test]
    async fn test_branch_takes_exactly_one_path() {
        let compiled = branching_graph();

        let flagged = compiled
            .invoke_traced(Value::text(r#"{"red_flag": true, "description": "x"}"#))
            .await
            .unwrap();
        assert_eq!(flagged.output, Value::text("A:x"));
        assert_eq!(flagged.visited(), vec!["classify", "a"]);

        let clear = compiled
            .invoke_traced(Value::text(r#"{"red_flag": false, "description": "y"}"#))
            .await
            .unwrap();
        assert_eq!(clear.output, Value::text("B:y"));
        assert_eq!(clear.visited(), vec!["classify", "b"]);

        // Unparseable classifier output falls back to the unflagged path
        let garbage = compiled
            .invoke_traced(Value::text("definitely not json"))
            .await
            .unwrap();
        assert_eq!(garbage.output, Value::text("B:"));
        assert_eq!(garbage.visited(), vec!["classify", "b"]);
    }

    #[tokio::test]
    async fn test_branch_is_deterministic() {
        let compiled = branching_graph();
        let input = r#"{"red_flag": true, "description": "same"}"#;
        for _ in 0..5 {
            let out = compiled.invoke(Value::text(input)).await.unwrap();
            assert_eq!(out, Value::text("A:same"));
        }
    }

    #[tokio::test]
    async fn test_unresolved_branch_aborts() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(upper("src")).unwrap();
        g.add_node(upper("a")).unwrap();
        g.add_edge(START, "src").unwrap();
        g.add_branch(
            "src",
            Branch::new("broken", vec!["a".into()], |_| Ok("elsewhere".into())),
        )
        .unwrap();
        g.add_edge("a", END).unwrap();
        let compiled = g.compile().unwrap();

        let err = compiled.invoke(Value::text("x")).await.unwrap_err();
        assert!(matches!(
            err,
            SkeinError::UnresolvedBranch { ref node, ref label } if node == "src" && label == "elsewhere"
        ));
    }

    #[tokio::test]
    async fn test_fan_out_isolation_and_stable_merge() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut g = Graph::new(ValueKind::Text, ValueKind::Vars);
        g.add_node(upper("root")).unwrap();
        for (id, label) in [("zeta", "z-plan"), ("alpha", "a-plan"), ("mid", "m-plan")] {
            let seen = seen.clone();
            let tag = id.to_string();
            g.add_node(
                Node::transform(id, ValueKind::Text, ValueKind::Text, move |v| {
                    seen.lock().unwrap().push(format!("{}<-{}", tag, v));
                    Ok(Value::text(format!("{} by {}", v, tag)))
                })
                .with_label(label),
            )
            .unwrap();
            g.add_edge("root", id).unwrap();
        }
        g.add_node(Node::merge("merge")).unwrap();
        for id in ["zeta", "alpha", "mid"] {
            g.add_edge(id, "merge").unwrap();
        }
        g.add_edge(START, "root").unwrap();
        g.add_edge("merge", END).unwrap();
        let compiled = g.compile().unwrap();

        let expected = Value::var(
            "content",
            "a-plan: TRIP by alpha\nm-plan: TRIP by mid\nz-plan: TRIP by zeta\n",
        );
        for _ in 0..3 {
            let out = compiled.invoke(Value::text("trip")).await.unwrap();
            assert_eq!(out, expected);
        }

        // Every sibling only ever saw the shared predecessor's output
        for entry in seen.lock().unwrap().iter() {
            assert!(entry.ends_with("<-TRIP"), "sibling saw {}", entry);
        }
    }

    #[tokio::test]
    async fn test_visitation_follows_topological_levels() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(upper("a")).unwrap();
        g.add_node(suffix("slow", "1")).unwrap();
        g.add_node(suffix("deep", "2")).unwrap();
        g.add_node(suffix("fast", "3")).unwrap();
        g.add_node(Node::transform("join", ValueKind::Merged, ValueKind::Text, |v| {
            Ok(Value::text(v.to_string()))
        }))
        .unwrap();
        g.add_edge(START, "a").unwrap();
        g.add_edge("a", "slow").unwrap();
        g.add_edge("slow", "deep").unwrap();
        g.add_edge("a", "fast").unwrap();
        g.add_edge("deep", "join").unwrap();
        g.add_edge("fast", "join").unwrap();
        g.add_edge("join", END).unwrap();
        let compiled = g.compile().unwrap();

        let result = compiled.invoke_traced(Value::text("x")).await.unwrap();
        assert_eq!(result.visited(), vec!["a", "slow", "fast", "deep", "join"]);
        assert_eq!(result.output, Value::text("deep: X12\nfast: X3"));
    }

    #[tokio::test]
    async fn test_node_failure_aborts_without_partial_output() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(Node::transform("boom", ValueKind::Text, ValueKind::Text, |_| {
            Err(SkeinError::LlmRequest("HTTP 500".into()))
        }))
        .unwrap();
        g.add_edge(START, "boom").unwrap();
        g.add_edge("boom", END).unwrap();
        let compiled = g.compile().unwrap();

        let err = compiled.invoke(Value::text("x")).await.unwrap_err();
        assert!(matches!(err, SkeinError::LlmRequest(_)));
    }

    #[tokio::test]
    async fn test_branch_colliding_with_plain_edge_into_plain_node() {
        // `b` always hears from `a`; the branch on `src` can also pick it
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(upper("a")).unwrap();
        g.add_node(upper("src")).unwrap();
        g.add_node(upper("b")).unwrap();
        g.add_edge(START, "a").unwrap();
        g.add_edge(START, "src").unwrap();
        g.add_branch(
            "src",
            Branch::new("pick", vec!["b".into(), END.into()], |_| Ok("b".into())),
        )
        .unwrap();
        g.add_edge("a", "b").unwrap();
        g.add_edge("b", END).unwrap();
        let compiled = g.compile().unwrap();

        assert!(matches!(
            compiled.invoke(Value::text("x")).await,
            Err(SkeinError::ConflictingInputs(id)) if id == "b"
        ));
    }

    #[tokio::test]
    async fn test_input_contract_checked() {
        let compiled = branching_graph();
        let err = compiled
            .invoke(Value::var("description", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SkeinError::ContractViolation { ref node, .. } if node == START));
    }

    #[tokio::test]
    async fn test_concurrent_invocations_share_graph() {
        let compiled = Arc::new(branching_graph());
        let mut handles = Vec::new();
        for i in 0..8 {
            let compiled = compiled.clone();
            handles.push(tokio::spawn(async move {
                let flag = i % 2 == 0;
                let input = format!(r#"{{"red_flag": {}, "description": "{}"}}"#, flag, i);
                (flag, i, compiled.invoke(Value::text(input)).await.unwrap())
            }));
        }
        for h in handles {
            let (flag, i, out) = h.await.unwrap();
            let expected = if flag { format!("A:{}", i) } else { format!("B:{}", i) };
            assert_eq!(out, Value::text(expected));
        }
    }
}
