//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Oryx.
//
// Oryx is free software: you can  redistribute it and/or  modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Oryx is distributed  in the hope  that it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Oryx. If not, see <http://www.gnu.org/licenses/>.

//! The THREAD algorithms of RFC 5256.
//!
//! ORDEREDSUBJECT groups messages by base subject and makes the oldest
//! message of each group the root of a flat thread. REFERENCES builds the
//! parent graph from the Message-Id and References headers, splices away
//! empty intermediate nodes (message-ids we never saw a message for), and
//! sorts sibling subtrees by the oldest internal date they contain.
//!
//! Both operate on plain row data fetched by the search machinery; there
//! is no I/O here.

use std::collections::{HashMap, HashSet};

use crate::store::threader::{base_subject, Threader};

/// What threading needs to know about one message.
#[derive(Clone, Debug)]
pub struct ThreadInfo {
    pub uid: u32,
    pub message_id: Option<String>,
    /// Message-ids from the References header, oldest first.
    pub references: Vec<String>,
    pub subject: String,
    /// Internal date as a UNIX timestamp.
    pub idate: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThreadNode {
    pub uid: u32,
    pub children: Vec<ThreadNode>,
}

/// ORDEREDSUBJECT threading: one thread per base subject, oldest
/// message first, the rest as its children in date order. Threads are
/// ordered by the date of their root.
pub fn ordered_subject(messages: &[ThreadInfo]) -> Vec<ThreadNode> {
    let mut index = Threader::new();
    for message in messages {
        index.note(message.uid, &message.subject);
    }
    let by_uid: HashMap<u32, &ThreadInfo> =
        messages.iter().map(|m| (m.uid, m)).collect();

    let mut done: HashSet<String> = HashSet::new();
    let mut threads: Vec<(i64, ThreadNode)> = Vec::new();
    for message in messages {
        if !done.insert(base_subject(&message.subject)) {
            continue;
        }
        let mut group: Vec<&ThreadInfo> = index
            .thread_of(&message.subject)
            .unwrap_or(&[])
            .iter()
            .filter_map(|uid| by_uid.get(uid).copied())
            .collect();
        group.sort_by_key(|m| (m.idate, m.uid));
        let root = group[0];
        let node = ThreadNode {
            uid: root.uid,
            children: group[1..]
                .iter()
                .map(|m| ThreadNode {
                    uid: m.uid,
                    children: Vec::new(),
                })
                .collect(),
        };
        threads.push((root.idate, node));
    }

    threads.sort_by_key(|&(idate, ref node)| (idate, node.uid));
    threads.into_iter().map(|(_, node)| node).collect()
}

/// REFERENCES threading.
pub fn references(messages: &[ThreadInfo]) -> Vec<ThreadNode> {
    // One container per message-id we hear about; `message` indexes into
    // `messages` when we actually have that message.
    struct Container {
        message: Option<usize>,
        parent: Option<usize>,
        children: Vec<usize>,
    }

    let mut containers: Vec<Container> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    fn obtain(
        containers: &mut Vec<Container>,
        by_id: &mut HashMap<String, usize>,
        id: &str,
    ) -> usize {
        if let Some(&ix) = by_id.get(id) {
            return ix;
        }
        containers.push(Container {
            message: None,
            parent: None,
            children: Vec::new(),
        });
        let ix = containers.len() - 1;
        by_id.insert(id.to_owned(), ix);
        ix
    }

    fn is_ancestor(
        containers: &[Container],
        candidate: usize,
        of: usize,
    ) -> bool {
        let mut cursor = Some(of);
        while let Some(ix) = cursor {
            if ix == candidate {
                return true;
            }
            cursor = containers[ix].parent;
        }
        false
    }

    for (msg_ix, message) in messages.iter().enumerate() {
        let this = match message.message_id {
            Some(ref id) => {
                let ix = obtain(&mut containers, &mut by_id, id);
                if containers[ix].message.is_some() {
                    // Duplicate message-id; give it an anonymous node.
                    containers.push(Container {
                        message: Some(msg_ix),
                        parent: None,
                        children: Vec::new(),
                    });
                    containers.len() - 1
                } else {
                    containers[ix].message = Some(msg_ix);
                    ix
                }
            },
            None => {
                containers.push(Container {
                    message: Some(msg_ix),
                    parent: None,
                    children: Vec::new(),
                });
                containers.len() - 1
            },
        };

        // Chain the references together, never introducing a loop and
        // never overwriting an existing parent.
        let mut previous: Option<usize> = None;
        for reference in &message.references {
            let ix = obtain(&mut containers, &mut by_id, reference);
            if let Some(prev) = previous {
                if containers[ix].parent.is_none()
                    && prev != ix
                    && !is_ancestor(&containers, ix, prev)
                {
                    containers[ix].parent = Some(prev);
                    containers[prev].children.push(ix);
                }
            }
            previous = Some(ix);
        }

        // The last reference is this message's parent; it wins over any
        // previously guessed parent.
        if let Some(parent) = previous {
            if parent != this
                && !is_ancestor(&containers, this, parent)
            {
                if let Some(old) = containers[this].parent.take() {
                    containers[old].children.retain(|&c| c != this);
                }
                containers[this].parent = Some(parent);
                containers[parent].children.push(this);
            }
        }
    }

    let roots: Vec<usize> = (0..containers.len())
        .filter(|&ix| containers[ix].parent.is_none())
        .collect();

    // Recursively build the output tree, splicing away containers with
    // no message.
    fn build(
        containers: &[Container],
        messages: &[ThreadInfo],
        ix: usize,
        out: &mut Vec<ThreadNode>,
    ) {
        let mut children = Vec::new();
        for &child in &containers[ix].children {
            build(containers, messages, child, &mut children);
        }
        sort_siblings(containers, messages, &mut children);

        match containers[ix].message {
            Some(msg_ix) => out.push(ThreadNode {
                uid: messages[msg_ix].uid,
                children,
            }),
            // Empty container: its children rise to this level.
            None => out.extend(children),
        }
    }

    fn oldest(
        messages: &[ThreadInfo],
        node: &ThreadNode,
    ) -> i64 {
        let own = messages
            .iter()
            .find(|m| m.uid == node.uid)
            .map_or(i64::MAX, |m| m.idate);
        node.children
            .iter()
            .map(|c| oldest(messages, c))
            .fold(own, i64::min)
    }

    fn sort_siblings(
        _containers: &[Container],
        messages: &[ThreadInfo],
        siblings: &mut Vec<ThreadNode>,
    ) {
        siblings.sort_by_key(|node| {
            (oldest(messages, node), node.uid)
        });
    }

    let mut out = Vec::new();
    for root in roots {
        build(&containers, messages, root, &mut out);
    }
    sort_siblings(&containers, messages, &mut out);
    out
}

/// Formats threads in the untagged THREAD response syntax.
pub fn format_threads(threads: &[ThreadNode]) -> String {
    fn members(node: &ThreadNode, out: &mut String) {
        out.push_str(&node.uid.to_string());
        match node.children.len() {
            0 => (),
            1 => {
                out.push(' ');
                members(&node.children[0], out);
            },
            _ => {
                for child in &node.children {
                    out.push_str("(");
                    members(child, out);
                    out.push_str(")");
                }
            },
        }
    }

    let mut out = String::new();
    for thread in threads {
        out.push('(');
        members(thread, &mut out);
        out.push(')');
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn msg(
        uid: u32,
        id: &str,
        refs: &[&str],
        subject: &str,
        idate: i64,
    ) -> ThreadInfo {
        ThreadInfo {
            uid,
            message_id: if id.is_empty() {
                None
            } else {
                Some(id.to_owned())
            },
            references: refs.iter().map(|&r| r.to_owned()).collect(),
            subject: subject.to_owned(),
            idate,
        }
    }

    #[test]
    fn ordered_subject_groups_and_orders() {
        let messages = vec![
            msg(1, "a", &[], "Plan", 100),
            msg(2, "b", &[], "Re: Plan", 200),
            msg(3, "c", &[], "Other", 150),
            msg(4, "d", &[], "RE: plan", 300),
        ];
        let threads = ordered_subject(&messages);
        assert_eq!(2, threads.len());
        assert_eq!(1, threads[0].uid);
        assert_eq!(
            vec![2, 4],
            threads[0]
                .children
                .iter()
                .map(|c| c.uid)
                .collect::<Vec<_>>(),
        );
        assert_eq!(3, threads[1].uid);
    }

    #[test]
    fn references_builds_parent_chain() {
        let messages = vec![
            msg(1, "root", &[], "x", 100),
            msg(2, "reply", &["root"], "Re: x", 200),
            msg(3, "reply2", &["root", "reply"], "Re: x", 300),
        ];
        let threads = references(&messages);
        assert_eq!(1, threads.len());
        assert_eq!(1, threads[0].uid);
        assert_eq!(2, threads[0].children[0].uid);
        assert_eq!(3, threads[0].children[0].children[0].uid);
    }

    #[test]
    fn references_splices_missing_intermediates() {
        // The middle of the chain was never delivered here.
        let messages = vec![
            msg(1, "root", &[], "x", 100),
            msg(2, "leaf", &["root", "ghost"], "Re: x", 200),
        ];
        let threads = references(&messages);
        assert_eq!(1, threads.len());
        assert_eq!(1, threads[0].uid);
        // "ghost" was spliced out; 2 hangs directly under 1.
        assert_eq!(2, threads[0].children[0].uid);
    }

    #[test]
    fn references_orders_siblings_by_oldest_date() {
        let messages = vec![
            msg(1, "root", &[], "x", 100),
            msg(2, "b1", &["root"], "Re: x", 500),
            msg(3, "b2", &["root"], "Re: x", 200),
            // An old message deep under the young branch drags it
            // forward.
            msg(4, "b1a", &["root", "b1"], "Re: x", 150),
        ];
        let threads = references(&messages);
        let children: Vec<u32> =
            threads[0].children.iter().map(|c| c.uid).collect();
        assert_eq!(vec![2, 3], children);
    }

    #[test]
    fn references_ignores_reference_loops() {
        let messages = vec![
            msg(1, "a", &["b"], "x", 100),
            msg(2, "b", &["a"], "x", 200),
        ];
        let threads = references(&messages);
        // No panic and both messages appear exactly once.
        let mut uids = Vec::new();
        fn collect(node: &ThreadNode, out: &mut Vec<u32>) {
            out.push(node.uid);
            for child in &node.children {
                collect(child, out);
            }
        }
        for t in &threads {
            collect(t, &mut uids);
        }
        uids.sort_unstable();
        assert_eq!(vec![1, 2], uids);
    }

    #[test]
    fn thread_response_format() {
        let threads = vec![
            ThreadNode {
                uid: 2,
                children: vec![ThreadNode {
                    uid: 3,
                    children: vec![
                        ThreadNode {
                            uid: 6,
                            children: Vec::new(),
                        },
                        ThreadNode {
                            uid: 4,
                            children: Vec::new(),
                        },
                    ],
                }],
            },
            ThreadNode {
                uid: 9,
                children: Vec::new(),
            },
        ];
        assert_eq!("(2 3(6)(4))(9)", format_threads(&threads));
    }
}
