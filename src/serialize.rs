use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apta::{Apta, Guard, Node};
use crate::config::{Config, ConfigError};
use crate::evaluation::evaluation_from_name;
use crate::input::Vocabulary;
use crate::merge::Merger;
use crate::{AttrId, NodeId};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Malformed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SnapshotError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    types: Vec<String>,
    alphabet: Vec<String>,
    nodes: Vec<SnapshotNode>,
    edges: Vec<SnapshotEdge>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotNode {
    id: NodeId,
    /// `-1` for the root; every other node keeps its provenance link.
    source: i64,
    symbol: Option<String>,
    red: bool,
    sink: Option<u32>,
    size: u32,
    finals: u32,
    access: Vec<String>,
    /// Nodes merged directly into this one, in merge order.
    merged: Vec<NodeId>,
    data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEdge {
    source: NodeId,
    target: NodeId,
    symbol: String,
    mins: Vec<(AttrId, f64)>,
    maxs: Vec<(AttrId, f64)>,
}

fn snapshot_of(merger: &Merger, vocab: &Vocabulary) -> Snapshot {
    let apta = merger.apta();
    let mut nodes = Vec::with_capacity(apta.len());
    let mut edges = Vec::new();
    for id in 0..apta.len() as NodeId {
        let node = apta.node(id);
        nodes.push(SnapshotNode {
            id,
            source: node.source.map_or(-1, |(s, _)| s as i64),
            symbol: node.source.map(|(_, s)| vocab.symbol_name(s).to_string()),
            red: node.red,
            sink: node.sink,
            size: node.size,
            finals: node.final_count,
            access: node
                .access
                .iter()
                .map(|&s| vocab.symbol_name(s).to_string())
                .collect(),
            merged: node.represents().to_vec(),
            data: node.data.write_json(vocab),
        });
        for guard in &node.guards {
            let Some(target) = guard.target else { continue };
            edges.push(SnapshotEdge {
                source: id,
                target,
                symbol: vocab.symbol_name(guard.symbol).to_string(),
                mins: guard.mins.clone(),
                maxs: guard.maxs.clone(),
            });
        }
    }
    Snapshot {
        types: vocab.types().map(|t| vocab.type_name(t).to_string()).collect(),
        alphabet: vocab
            .symbols()
            .map(|s| vocab.symbol_name(s).to_string())
            .collect(),
        nodes,
        edges,
    }
}

/// Serializes the full hypothesis — node ids, colors, sizes, transitions,
/// union-find structure and the opaque evaluation payloads — as JSON.
pub fn write_snapshot(merger: &Merger, vocab: &Vocabulary) -> serde_json::Value {
    serde_json::to_value(snapshot_of(merger, vocab)).expect("snapshot structs serialize cleanly")
}

/// [`write_snapshot`] rendered as a stable, pretty-printed string;
/// serialize → deserialize → serialize yields identical output.
pub fn snapshot_string(merger: &Merger, vocab: &Vocabulary) -> String {
    serde_json::to_string_pretty(&snapshot_of(merger, vocab))
        .expect("snapshot structs serialize cleanly")
}

/// Reconstructs a merger and its vocabulary from a snapshot. Node ids,
/// colors and transition structure come back exactly as written; per-node
/// tail lists are not part of the format.
pub fn read_snapshot(
    value: &serde_json::Value,
    config: Config,
) -> Result<(Merger, Vocabulary), SnapshotError> {
    let snapshot: Snapshot = serde_json::from_value(value.clone())?;
    let mut vocab = Vocabulary::new();
    for name in &snapshot.types {
        vocab.type_id(name);
    }
    for name in &snapshot.alphabet {
        vocab.symbol_id(name);
    }

    let eval = evaluation_from_name(&config.evaluation, &config)?;

    let mut nodes: Vec<Node> = Vec::with_capacity(snapshot.nodes.len());
    let mut root = None;
    for (index, sn) in snapshot.nodes.iter().enumerate() {
        if sn.id as usize != index {
            return Err(SnapshotError::malformed(format!(
                "node ids must be dense and ordered, found {} at position {index}",
                sn.id
            )));
        }
        let source = if sn.source < 0 {
            root = Some(sn.id);
            None
        } else {
            let symbol = sn
                .symbol
                .as_deref()
                .ok_or_else(|| SnapshotError::malformed("non-root node misses its symbol"))?;
            let symbol = vocab
                .try_symbol(symbol)
                .ok_or_else(|| SnapshotError::malformed("source symbol not in alphabet"))?;
            Some((sn.source as NodeId, symbol))
        };
        let access = sn
            .access
            .iter()
            .map(|name| {
                vocab
                    .try_symbol(name)
                    .ok_or_else(|| SnapshotError::malformed("access symbol not in alphabet"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut data = eval.fresh_data();
        data.read_json(&sn.data, &mut vocab)?;
        nodes.push(Node {
            number: sn.id,
            source,
            red: sn.red,
            depth: access.len() as u32,
            size: sn.size,
            final_count: sn.finals,
            sink: sn.sink,
            access,
            guards: Vec::new(),
            representative: None,
            represents: sn.merged.clone(),
            data,
            tails: Vec::new(),
        });
    }
    let root = root.ok_or_else(|| SnapshotError::malformed("no root node in snapshot"))?;

    for edge in &snapshot.edges {
        let symbol = vocab
            .try_symbol(&edge.symbol)
            .ok_or_else(|| SnapshotError::malformed("edge symbol not in alphabet"))?;
        let guard = Guard {
            symbol,
            mins: edge.mins.clone(),
            maxs: edge.maxs.clone(),
            target: Some(edge.target),
        };
        nodes
            .get_mut(edge.source as usize)
            .ok_or_else(|| SnapshotError::malformed("edge source out of range"))?
            .guards
            .push(guard);
    }

    // restore representative links from the explicit merge lists
    for id in 0..nodes.len() {
        for m in nodes[id].represents.clone() {
            let member = nodes
                .get_mut(m as usize)
                .ok_or_else(|| SnapshotError::malformed("merged member out of range"))?;
            member.representative = Some(id as NodeId);
        }
    }

    let apta = Apta::from_raw_parts(nodes, root, config.store_tails);
    Ok((Merger::from_parts(apta, eval, config), vocab))
}

/// Renders the merged view as graphviz dot, with the original's styling:
/// fill colors per role, evidence-scaled pen widths, guard bounds on edge
/// labels. Which roles show up is steered by the display flags.
pub fn dot_string(merger: &Merger, vocab: &Vocabulary) -> String {
    let apta = merger.apta();
    let flags = merger.config().display;
    let mut out = String::new();
    out.push_str("digraph DFA {\n");
    let root = apta.find(apta.root());
    let _ = writeln!(out, "\t{root} [label=\"root\" shape=box];");
    let _ = writeln!(out, "\t\tI -> {root};");

    let shown = |n: NodeId| {
        let node = apta.node(n);
        let by_role = if node.red {
            flags.red
        } else if apta.is_blue(n) {
            flags.blue
        } else {
            flags.white
        };
        by_role && (!apta.is_sink(n) || flags.sinks)
    };

    for n in apta.merged_walk() {
        let node = apta.node(n);
        if !shown(n) {
            continue;
        }

        let fill = if node.red {
            "firebrick1"
        } else if apta.is_blue(n) {
            "dodgerblue1"
        } else {
            "ghostwhite"
        };
        let pen = (1.0 + node.size as f64).ln();
        let _ = writeln!(
            out,
            "\t{} [label=\"{} #{}\\n{}\", style=filled, fillcolor=\"{}\", penwidth={:.3}];",
            n,
            n,
            node.size,
            node.data.state_label(vocab),
            fill,
            pen
        );

        for m in apta.class_members(n) {
            for guard in &apta.node(m).guards {
                let Some(target) = guard.target else { continue };
                let child = apta.find(target);
                if !shown(child) {
                    continue;
                }
                let mut label = vocab.symbol_name(guard.symbol).to_string();
                for &(attr, bound) in &guard.mins {
                    let _ = write!(label, "\\na{attr} >= {bound}");
                }
                for &(attr, bound) in &guard.maxs {
                    let _ = write!(label, "\\na{attr} < {bound}");
                }
                let _ = writeln!(
                    out,
                    "\t\t{} -> {} [label=\"{}\", penwidth={:.3}];",
                    n, child, label, pen
                );
            }
        }
    }
    out.push_str("}\n");
    out
}
