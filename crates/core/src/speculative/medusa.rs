//! Medusa token trees.
//!
//! A tree is described by its choices: each choice is a path of per-head
//! ranks, e.g. `[0, 1]` means "top-1 of head 0, then top-2 of head 1". Node 0
//! is the root (the last committed token); node `i + 1` is choice `i`. The
//! target model scores every node in one pass, giving for each node the token
//! that should follow it.

use std::collections::HashMap;

use crate::error::{DecodeError, Result};
use crate::sampling::online_softmax::reduce_md_top_k;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MedusaNode {
    parent: usize,
    head: usize,
    rank: usize,
}

/// Static draft-token tree shared by every Medusa slot of a session.
#[derive(Debug, Clone)]
pub struct MedusaTree {
    nodes: Vec<MedusaNode>,
    /// Root-to-leaf node lists, in choice order.
    paths: Vec<Vec<usize>>,
    num_heads: usize,
}

/// Outcome of validating one slot's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedusaAcceptance {
    /// Index into [`MedusaTree::paths`] of the winning path.
    pub path: usize,
    /// Draft tokens accepted along the path.
    pub accepted: usize,
    /// Accepted draft tokens followed by the target token after them.
    pub tokens: Vec<u32>,
    /// Draft-buffer offsets (`node - 1`) of the accepted nodes.
    pub path_offsets: Vec<usize>,
    /// Deepest accepted node; the next drafts are predicted from here.
    pub last_node: usize,
}

impl MedusaTree {
    pub fn from_choices(choices: &[Vec<usize>]) -> Result<Self> {
        let mut index_of: HashMap<&[usize], usize> = HashMap::new();
        let mut nodes = vec![MedusaNode {
            parent: 0,
            head: 0,
            rank: 0,
        }];
        let mut num_heads = 0;
        for (i, choice) in choices.iter().enumerate() {
            let Some((&rank, prefix)) = choice.split_last() else {
                return Err(DecodeError::InvalidConfig(format!(
                    "medusa choice {i} is empty"
                )));
            };
            let parent = if prefix.is_empty() {
                0
            } else {
                *index_of.get(prefix).ok_or_else(|| {
                    DecodeError::InvalidConfig(format!(
                        "medusa choice {choice:?} appears before its prefix"
                    ))
                })?
            };
            if index_of.insert(choice.as_slice(), i + 1).is_some() {
                return Err(DecodeError::InvalidConfig(format!(
                    "duplicate medusa choice {choice:?}"
                )));
            }
            nodes.push(MedusaNode {
                parent,
                head: prefix.len(),
                rank,
            });
            num_heads = num_heads.max(choice.len());
        }

        let mut is_parent = vec![false; nodes.len()];
        for node in &nodes[1..] {
            is_parent[node.parent] = true;
        }
        let paths = (0..nodes.len())
            .filter(|&n| !is_parent[n] && (n > 0 || nodes.len() == 1))
            .map(|leaf| {
                let mut path = vec![leaf];
                let mut n = leaf;
                while n != 0 {
                    n = nodes[n].parent;
                    path.push(n);
                }
                path.reverse();
                path
            })
            .collect();

        Ok(Self {
            nodes,
            paths,
            num_heads,
        })
    }

    /// Root plus one node per choice.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_draft_tokens(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn paths(&self) -> &[Vec<usize>] {
        &self.paths
    }

    /// Pick the path whose drafts agree with the target the longest.
    ///
    /// `draft_tokens[i]` is the draft at node `i + 1` and `target_ids[n]` the
    /// target's token following node `n`. The first path wins ties.
    pub fn accept(&self, draft_tokens: &[u32], target_ids: &[u32]) -> Result<MedusaAcceptance> {
        if target_ids.len() != self.num_nodes() {
            return Err(DecodeError::InvalidConfig(format!(
                "medusa tree has {} nodes, got {} target tokens",
                self.num_nodes(),
                target_ids.len()
            )));
        }
        let mut best = (0usize, 0usize);
        for (p, path) in self.paths.iter().enumerate() {
            let accepted = path
                .windows(2)
                .take_while(|w| draft_tokens.get(w[1] - 1) == Some(&target_ids[w[0]]))
                .count();
            if accepted > best.1 {
                best = (p, accepted);
            }
        }
        let (path_index, accepted) = best;
        let path = &self.paths[path_index];
        let nodes = &path[..=accepted.min(path.len() - 1)];
        Ok(MedusaAcceptance {
            path: path_index,
            accepted,
            tokens: nodes.iter().map(|&n| target_ids[n]).collect(),
            path_offsets: nodes[1..].iter().map(|&n| n - 1).collect(),
            last_node: *nodes.last().unwrap_or(&0),
        })
    }

    /// Draft tokens for the next step, read from the Medusa head logits at
    /// `node`. `medusa_logits` is `[num_nodes, num_heads, vocab]`.
    pub fn next_draft_tokens(
        &self,
        medusa_logits: &[f32],
        node: usize,
        vocab_size: usize,
    ) -> Result<Vec<u32>> {
        let row_len = self.num_heads * vocab_size;
        let base = node * row_len;
        if medusa_logits.len() < base + row_len {
            return Err(DecodeError::InvalidConfig(format!(
                "medusa logits of length {} do not cover node {node}",
                medusa_logits.len()
            )));
        }
        let mut per_head: Vec<Vec<u32>> = Vec::with_capacity(self.num_heads);
        for head in 0..self.num_heads {
            let k = self.nodes[1..]
                .iter()
                .filter(|n| n.head == head)
                .map(|n| n.rank + 1)
                .max()
                .unwrap_or(0)
                .min(vocab_size);
            let row = &medusa_logits[base + head * vocab_size..base + (head + 1) * vocab_size];
            let (_, top) = reduce_md_top_k(row, None, 0, k);
            per_head.push(top.entries().iter().map(|&(id, _)| id).collect());
        }
        Ok(self.nodes[1..]
            .iter()
            .map(|n| per_head[n.head].get(n.rank).copied().unwrap_or(0))
            .collect())
    }
}
