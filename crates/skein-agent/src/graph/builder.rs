use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use tracing::debug;

use skein_core::error::{Result, SkeinError, Violation};

use super::edge::{Branch, Successors};
use super::executor::CompiledGraph;
use super::node::Node;
use super::value::ValueKind;

/// Reserved id of the virtual entry node.
pub const START: &str = "start";
/// Reserved id of the virtual exit node.
pub const END: &str = "end";

/// A workflow graph under construction.
///
/// `start` and `end` exist implicitly. The graph's input contract is what
/// `start` produces; its output contract is what `end` expects.
pub struct Graph {
    input: ValueKind,
    output: ValueKind,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    successors: HashMap<String, Successors>,
}

impl Graph {
    pub fn new(input: ValueKind, output: ValueKind) -> Self {
        Self {
            input,
            output,
            nodes: Vec::new(),
            index: HashMap::new(),
            successors: HashMap::new(),
        }
    }

    fn is_known(&self, id: &str) -> bool {
        id == START || id == END || self.index.contains_key(id)
    }

    fn require_known(&self, id: &str) -> Result<()> {
        if self.is_known(id) {
            Ok(())
        } else {
            Err(SkeinError::UnknownNode(id.to_string()))
        }
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.is_known(&node.id) {
            return Err(SkeinError::DuplicateNode(node.id));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Connect `from` to `to`. Several edges may leave one node.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        self.require_known(from)?;
        self.require_known(to)?;
        match self
            .successors
            .entry(from.to_string())
            .or_insert_with(|| Successors::Edges(Vec::new()))
        {
            Successors::Edges(targets) => {
                if !targets.iter().any(|t| t == to) {
                    targets.push(to.to_string());
                }
                Ok(())
            }
            Successors::Branch(_) => Err(SkeinError::AmbiguousSuccessor(from.to_string())),
        }
    }

    /// Bind a branch to `from`. Every candidate must already be registered.
    pub fn add_branch(&mut self, from: &str, branch: Branch) -> Result<()> {
        self.require_known(from)?;
        for candidate in &branch.candidates {
            self.require_known(candidate)?;
        }
        if self.successors.contains_key(from) {
            return Err(SkeinError::AmbiguousSuccessor(from.to_string()));
        }
        self.successors
            .insert(from.to_string(), Successors::Branch(branch));
        Ok(())
    }

    /// All ids in a fixed order: start, registered nodes, end.
    fn ordered_ids(&self) -> Vec<&str> {
        std::iter::once(START)
            .chain(self.nodes.iter().map(|n| n.id.as_str()))
            .chain(std::iter::once(END))
            .collect()
    }

    fn produced(&self, id: &str) -> ValueKind {
        match id {
            START => self.input,
            _ => self
                .index
                .get(id)
                .map_or(ValueKind::Any, |&i| self.nodes[i].output),
        }
    }

    fn label<'a>(&'a self, id: &'a str) -> &'a str {
        self.index
            .get(id)
            .map_or(id, |&i| self.nodes[i].label.as_str())
    }

    fn expected(&self, id: &str) -> ValueKind {
        match id {
            END => self.output,
            _ => self
                .index
                .get(id)
                .map_or(ValueKind::Any, |&i| self.nodes[i].input),
        }
    }

    /// Edges that take part in ordering: none into `start`, none out of `end`.
    fn flow_edges(&self) -> Vec<(&str, &str)> {
        let mut edges = Vec::new();
        for from in self.ordered_ids() {
            if from == END {
                continue;
            }
            if let Some(succ) = self.successors.get(from) {
                for to in succ.targets() {
                    if to != START {
                        edges.push((from, to.as_str()));
                    }
                }
            }
        }
        edges
    }

    /// Validate the graph and freeze it.
    ///
    /// Every problem is collected before failing.
    pub fn compile(self) -> Result<CompiledGraph> {
        let mut violations = Vec::new();
        let ids = self.ordered_ids();
        let position: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        if !self.successors.contains_key(START) {
            violations.push(Violation::NoEntry);
        }
        if let Some(succ) = self.successors.get(END) {
            for to in succ.targets() {
                violations.push(Violation::EdgeFromEnd(to.clone()));
            }
        }
        for from in &ids {
            if let Some(succ) = self.successors.get(*from) {
                if succ.targets().iter().any(|t| t == START) {
                    violations.push(Violation::EdgeIntoStart(from.to_string()));
                }
            }
        }
        for node in &self.nodes {
            if !self.successors.contains_key(&node.id) {
                violations.push(Violation::DeadEnd(node.id.clone()));
            }
        }

        let edges = self.flow_edges();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for &(from, to) in &edges {
            adjacency.entry(from).or_default().push(to);
        }

        // Reachability from start
        let mut seen: HashSet<&str> = HashSet::from([START]);
        let mut queue = VecDeque::from([START]);
        while let Some(id) = queue.pop_front() {
            for &next in adjacency.get(id).into_iter().flatten() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        for id in ids.iter().skip(1) {
            if !seen.contains(id) {
                violations.push(Violation::Unreachable(id.to_string()));
            }
        }

        let (order, cyclic) = topo_sort(&ids, &position, &edges);
        if !cyclic.is_empty() {
            violations.push(Violation::Cycle(cyclic.iter().map(|s| s.to_string()).collect()));
        }

        for &(from, to) in &edges {
            let produced = self.produced(from);
            let expected = self.expected(to);
            if !expected.accepts(produced) {
                violations.push(Violation::ContractMismatch {
                    from: from.to_string(),
                    to: to.to_string(),
                    produced: produced.to_string(),
                    expected: expected.to_string(),
                });
            }
        }

        self.check_inputs(&ids, &edges, &mut violations);

        if !violations.is_empty() {
            return Err(SkeinError::GraphValidation(violations));
        }

        // Longest-path depth: every node runs after all of its predecessors
        let mut depth: HashMap<&str, usize> = HashMap::new();
        for &id in &order {
            let d = depth.get(id).copied().unwrap_or(0);
            for &next in adjacency.get(id).into_iter().flatten() {
                let entry = depth.entry(next).or_insert(0);
                *entry = (*entry).max(d + 1);
            }
        }
        let mut levels: Vec<Vec<String>> = Vec::new();
        for &id in &order {
            if id == START || id == END {
                continue;
            }
            let d = depth.get(id).copied().unwrap_or(1).max(1);
            if levels.len() < d {
                levels.resize_with(d, Vec::new);
            }
            levels[d - 1].push(id.to_string());
        }
        for level in &mut levels {
            level.sort_by_key(|id| position[id.as_str()]);
        }
        levels.retain(|l| !l.is_empty());

        debug!(
            nodes = self.nodes.len(),
            levels = levels.len(),
            "Graph compiled"
        );

        Ok(CompiledGraph::new(
            self.input,
            self.output,
            self.nodes,
            self.successors,
            levels,
        ))
    }
}

impl Graph {
    /// Fan-in labels must be distinct, and a single-input node must not have
    /// two producers that run on every invocation.
    fn check_inputs(&self, ids: &[&str], edges: &[(&str, &str)], violations: &mut Vec<Violation>) {
        // Nodes reached from start through plain edges only run unconditionally
        let mut always: HashSet<&str> = HashSet::from([START]);
        let mut queue = VecDeque::from([START]);
        while let Some(id) = queue.pop_front() {
            if let Some(Successors::Edges(targets)) = self.successors.get(id) {
                for next in targets {
                    if next != START && always.insert(next.as_str()) {
                        queue.push_back(next.as_str());
                    }
                }
            }
        }

        for &id in ids.iter().skip(1) {
            let preds: Vec<&str> = edges
                .iter()
                .filter(|&&(_, to)| to == id)
                .map(|&(from, _)| from)
                .collect();

            if self.expected(id) == ValueKind::Merged {
                let mut labels = HashSet::new();
                let mut reported = HashSet::new();
                for &from in &preds {
                    let label = self.label(from);
                    if !labels.insert(label) && reported.insert(label) {
                        violations.push(Violation::DuplicateFanInLabel {
                            node: id.to_string(),
                            label: label.to_string(),
                        });
                    }
                }
                continue;
            }

            let unconditional: Vec<String> = preds
                .iter()
                .filter(|&&from| {
                    always.contains(from)
                        && matches!(self.successors.get(from), Some(Successors::Edges(_)))
                })
                .map(|from| from.to_string())
                .collect();
            if unconditional.len() > 1 {
                violations.push(Violation::MultipleInputs {
                    node: id.to_string(),
                    sources: unconditional,
                });
            }
        }
    }
}

/// Kahn's algorithm, ties broken by registration position.
///
/// Returns the order and the ids left on or between cycles.
fn topo_sort<'a>(
    ids: &[&'a str],
    position: &HashMap<&'a str, usize>,
    edges: &[(&'a str, &'a str)],
) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut indegree: HashMap<&str, usize> = ids.iter().map(|&id| (id, 0)).collect();
    for &(_, to) in edges {
        *indegree.entry(to).or_default() += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = ids
        .iter()
        .filter(|&&id| indegree.get(id) == Some(&0))
        .filter_map(|&id| position.get(id).map(|&p| Reverse(p)))
        .collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(Reverse(pos)) = ready.pop() {
        let id = ids[pos];
        order.push(id);
        for &(from, to) in edges {
            if from != id {
                continue;
            }
            let d = indegree.entry(to).or_default();
            *d -= 1;
            if *d == 0 {
                if let Some(&p) = position.get(to) {
                    ready.push(Reverse(p));
                }
            }
        }
    }

    if order.len() == ids.len() {
        return (order, Vec::new());
    }

    // Peel off nodes that only lead out of the cyclic remainder
    let done: HashSet<&str> = order.iter().copied().collect();
    let mut remaining: Vec<&str> = ids.iter().copied().filter(|id| !done.contains(id)).collect();
    loop {
        let live: HashSet<&str> = remaining.iter().copied().collect();
        let before = remaining.len();
        remaining.retain(|&id| {
            edges
                .iter()
                .any(|&(from, to)| from == id && live.contains(to))
        });
        if remaining.len() == before {
            break;
        }
    }
    (order, remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::value::Value;

    fn pass(id: &str, kind: ValueKind) -> Node {
        Node::transform(id, kind, kind, Ok)
    }

    fn violations(result: Result<CompiledGraph>) -> Vec<Violation> {
        match result {
            Err(SkeinError::GraphValidation(v)) => v,
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("graph compiled"),
        }
    }

    #[test]
    fn test_duplicate_and_reserved_ids() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(pass("a", ValueKind::Text)).unwrap();
        assert!(matches!(
            g.add_node(pass("a", ValueKind::Text)),
            Err(SkeinError::DuplicateNode(id)) if id == "a"
        ));
        assert!(matches!(
            g.add_node(pass(END, ValueKind::Text)),
            Err(SkeinError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_unknown_endpoints() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(pass("a", ValueKind::Text)).unwrap();
        assert!(matches!(
            g.add_edge("a", "ghost"),
            Err(SkeinError::UnknownNode(id)) if id == "ghost"
        ));
        assert!(matches!(
            g.add_branch("a", Branch::on_flag("b", "a", "nowhere")),
            Err(SkeinError::UnknownNode(id)) if id == "nowhere"
        ));
    }

    #[test]
    fn test_edges_and_branch_are_exclusive() {
        let mut g = Graph::new(ValueKind::Judgment, ValueKind::Judgment);
        g.add_node(pass("x", ValueKind::Judgment)).unwrap();
        g.add_node(pass("y", ValueKind::Judgment)).unwrap();
        g.add_edge(START, "x").unwrap();
        assert!(matches!(
            g.add_branch(START, Branch::on_flag("f", "x", "y")),
            Err(SkeinError::AmbiguousSuccessor(id)) if id == START
        ));

        g.add_branch("x", Branch::on_flag("f", "y", END)).unwrap();
        assert!(matches!(
            g.add_edge("x", "y"),
            Err(SkeinError::AmbiguousSuccessor(_))
        ));
    }

    #[test]
    fn test_compile_collects_every_violation() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(pass("orphan", ValueKind::Text)).unwrap();
        g.add_node(pass("p", ValueKind::Text)).unwrap();
        g.add_node(pass("q", ValueKind::Text)).unwrap();
        g.add_edge("p", "q").unwrap();
        g.add_edge("q", "p").unwrap();

        let v = violations(g.compile());
        assert!(v.contains(&Violation::NoEntry));
        assert!(v.contains(&Violation::DeadEnd("orphan".into())));
        assert!(v.contains(&Violation::Unreachable("orphan".into())));
        assert!(v.contains(&Violation::Unreachable(END.into())));
        assert!(v.contains(&Violation::Cycle(vec!["p".into(), "q".into()])));
    }

    #[test]
    fn test_cycle_report_excludes_downstream_nodes() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        for id in ["a", "b", "tail"] {
            g.add_node(pass(id, ValueKind::Text)).unwrap();
        }
        g.add_edge(START, "a").unwrap();
        g.add_edge("a", "b").unwrap();
        g.add_edge("b", "a").unwrap();
        g.add_edge("b", "tail").unwrap();
        g.add_edge("tail", END).unwrap();

        let v = violations(g.compile());
        assert_eq!(
            v.iter().find(|x| matches!(x, Violation::Cycle(_))),
            Some(&Violation::Cycle(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn test_contract_mismatch_and_start_end_misuse() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Message);
        g.add_node(pass("judge", ValueKind::Judgment)).unwrap();
        g.add_edge(START, "judge").unwrap();
        g.add_edge("judge", END).unwrap();
        g.add_edge(END, "judge").unwrap();

        let v = violations(g.compile());
        assert!(v.contains(&Violation::ContractMismatch {
            from: START.into(),
            to: "judge".into(),
            produced: "text".into(),
            expected: "judgment".into(),
        }));
        assert!(v.contains(&Violation::ContractMismatch {
            from: "judge".into(),
            to: END.into(),
            produced: "judgment".into(),
            expected: "message".into(),
        }));
        assert!(v.contains(&Violation::EdgeFromEnd("judge".into())));
    }

    #[test]
    fn test_edge_into_start_is_reported() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(pass("a", ValueKind::Text)).unwrap();
        g.add_edge(START, "a").unwrap();
        g.add_edge("a", START).unwrap();
        g.add_edge("a", END).unwrap();
        let v = violations(g.compile());
        assert_eq!(v, vec![Violation::EdgeIntoStart("a".into())]);
    }

    #[test]
    fn test_duplicate_fan_in_label_is_reported() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        g.add_node(pass("x", ValueKind::Text).with_label("plan")).unwrap();
        g.add_node(pass("y", ValueKind::Text).with_label("plan")).unwrap();
        g.add_node(pass("z", ValueKind::Text)).unwrap();
        g.add_node(Node::transform("merge", ValueKind::Merged, ValueKind::Text, |v| {
            Ok(Value::text(v.to_string()))
        }))
        .unwrap();
        for id in ["x", "y", "z"] {
            g.add_edge(START, id).unwrap();
            g.add_edge(id, "merge").unwrap();
        }
        g.add_edge("merge", END).unwrap();

        let v = violations(g.compile());
        assert_eq!(
            v,
            vec![Violation::DuplicateFanInLabel {
                node: "merge".into(),
                label: "plan".into(),
            }]
        );
        assert!(v[0].to_string().contains("'plan'"));
    }

    #[test]
    fn test_fan_in_keys_by_label_not_id() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Vars);
        g.add_node(pass("x", ValueKind::Text).with_label("x-plan")).unwrap();
        g.add_node(pass("y", ValueKind::Text).with_label("x")).unwrap();
        g.add_node(Node::merge("merge")).unwrap();
        for id in ["x", "y"] {
            g.add_edge(START, id).unwrap();
            g.add_edge(id, "merge").unwrap();
        }
        g.add_edge("merge", END).unwrap();
        assert!(g.compile().is_ok());
    }

    #[test]
    fn test_two_unconditional_inputs_into_plain_node() {
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        for id in ["a", "b", "c"] {
            g.add_node(pass(id, ValueKind::Text)).unwrap();
        }
        g.add_edge(START, "a").unwrap();
        g.add_edge(START, "b").unwrap();
        g.add_edge("a", "c").unwrap();
        g.add_edge("b", "c").unwrap();
        g.add_edge("a", END).unwrap();
        g.add_edge("c", END).unwrap();

        let v = violations(g.compile());
        assert_eq!(
            v,
            vec![
                Violation::MultipleInputs {
                    node: "c".into(),
                    sources: vec!["a".into(), "b".into()],
                },
                Violation::MultipleInputs {
                    node: END.into(),
                    sources: vec!["a".into(), "c".into()],
                },
            ]
        );
    }

    #[test]
    fn test_exclusive_branch_paths_may_share_a_plain_node() {
        let mut g = Graph::new(ValueKind::Judgment, ValueKind::Text);
        g.add_node(pass("judge", ValueKind::Judgment)).unwrap();
        g.add_node(Node::notice("yes", ValueKind::Judgment, "flagged")).unwrap();
        g.add_node(Node::notice("no", ValueKind::Judgment, "clear")).unwrap();
        g.add_node(pass("tail", ValueKind::Text)).unwrap();
        g.add_edge(START, "judge").unwrap();
        g.add_branch("judge", Branch::on_flag("flag", "yes", "no")).unwrap();
        g.add_edge("yes", "tail").unwrap();
        g.add_edge("no", "tail").unwrap();
        g.add_edge("tail", END).unwrap();
        assert!(g.compile().is_ok());
    }

    #[test]
    fn test_levels_follow_longest_path() {
        // start -> a -> b -> end, and a -> c -> end; c joins at depth 2 with b
        let mut g = Graph::new(ValueKind::Text, ValueKind::Text);
        for id in ["a", "b", "c"] {
            g.add_node(pass(id, ValueKind::Text)).unwrap();
        }
        g.add_node(Node::transform("join", ValueKind::Merged, ValueKind::Text, |v| {
            Ok(Value::text(v.to_string()))
        }))
        .unwrap();
        g.add_edge(START, "a").unwrap();
        g.add_edge("a", "b").unwrap();
        g.add_edge("a", "c").unwrap();
        g.add_edge("b", "join").unwrap();
        g.add_edge("c", "join").unwrap();
        g.add_edge("join", END).unwrap();

        let compiled = g.compile().unwrap();
        assert_eq!(
            compiled.levels(),
            &[
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["join".to_string()],
            ]
        );
    }
}
