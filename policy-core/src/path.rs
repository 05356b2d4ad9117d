//! Path and loop engine over the zone/router graph.
//!
//! ## Graph
//!
//! Nodes are zones and routers taking part in path computation (managed or
//! semi-managed); edges are the interfaces of those routers. The graph may
//! contain cycles from redundant devices.
//!
//! ## Loops
//!
//! A depth-first traversal from the first zone of every connected component
//! records the spanning tree edge towards the root and detects back edges.
//! Every back edge opens a loop whose exit is the node it returns to; loops
//! found to overlap are chained through a redirect to one canonical loop,
//! the one whose exit lies closest to the root. Loops therefore match the
//! biconnected parts of the graph. Distances are hop counts from the root.
//!
//! ## Queries
//!
//! A path between two nodes climbs from the node with the larger distance
//! towards the root until both meet or share a loop. Tree edges are unique;
//! inside a loop every simple path honouring path restrictions is valid and
//! all of them are used. Results are memoized per node pair and always
//! computed in one canonical direction, so a path and its reverse match
//! exactly.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use thiserror::Error;
use tracing::debug;

use crate::diag::Diagnostics;
use crate::model::{IntfId, Object, PathRestrictionId, RouterId, Topology, ZoneId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathNode {
    Zone(ZoneId),
    Router(RouterId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loop {
    pub exit: PathNode,
    /// Distance of the exit node from the root.
    pub distance: usize,
    redirect: Option<LoopId>,
    depth: usize,
}

/// One router passed by a path.
///
/// `in_intf` is `None` for traffic starting at the router itself,
/// `out_intf` is `None` for traffic addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hop {
    pub in_intf: Option<IntfId>,
    pub router: RouterId,
    pub out_intf: Option<IntfId>,
}

impl Hop {
    fn reversed(self) -> Self {
        Self {
            in_intf: self.out_intf,
            router: self.router,
            out_intf: self.in_intf,
        }
    }
}

/// All routers and interfaces of the valid paths between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Walk {
    /// Router hops in path order.
    pub hops: Vec<Hop>,
    /// Interfaces leaving the start node.
    pub first: Vec<IntfId>,
    /// Interfaces entering the end node.
    pub last: Vec<IntfId>,
}

impl Walk {
    fn reversed(&self) -> Self {
        Self {
            hops: self.hops.iter().rev().map(|hop| hop.reversed()).collect(),
            first: self.last.clone(),
            last: self.first.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("no path between {from} and {to}")]
    NoPath { from: String, to: String },
    #[error("path restrictions forbid every path between {from} and {to}")]
    Restricted { from: String, to: String },
}

#[derive(Debug, Clone, Copy)]
enum Segment {
    Tree(IntfId),
    Loop { id: LoopId, from: usize, to: usize },
}

#[derive(Debug)]
struct LoopPaths {
    paths: Vec<Vec<IntfId>>,
    /// Restrictions used by every path.
    mandatory: BTreeSet<PathRestrictionId>,
}

type LoopKey = (LoopId, usize, usize, BTreeSet<PathRestrictionId>);

/// Node on the depth-first search stack.
struct Frame {
    idx: usize,
    /// Interface the node was entered by.
    parent: Option<IntfId>,
    neighbours: Vec<(IntfId, usize)>,
    cursor: usize,
    own: Option<LoopId>,
}

pub struct PathEngine {
    zone_count: usize,
    visited: Vec<bool>,
    distance: Vec<usize>,
    to_root: Vec<Option<IntfId>>,
    node_loop: Vec<Option<LoopId>>,
    intf_loop: Vec<Option<LoopId>>,
    loops: Vec<Loop>,
    restrict: Vec<Vec<PathRestrictionId>>,
    loop_memo: HashMap<LoopKey, Rc<LoopPaths>>,
    walk_memo: HashMap<(usize, usize), Result<Rc<Walk>, PathError>>,
    next_memo: HashMap<(usize, usize), Vec<IntfId>>,
}

impl PathEngine {
    /// Find loops and distances, then drop path restriction elements outside loops.
    pub fn new(topo: &Topology, diag: &Diagnostics) -> Self {
        let zone_count = topo.zones.len();
        let nodes = zone_count + topo.routers.len();
        let mut engine = Self {
            zone_count,
            visited: vec![false; nodes],
            distance: vec![0; nodes],
            to_root: vec![None; nodes],
            node_loop: vec![None; nodes],
            intf_loop: vec![None; topo.interfaces.len()],
            loops: Vec::new(),
            restrict: vec![Vec::new(); topo.interfaces.len()],
            loop_memo: HashMap::new(),
            walk_memo: HashMap::new(),
            next_memo: HashMap::new(),
        };
        let mut depth = vec![0; nodes];
        let mut active = vec![false; nodes];
        let mut roots = Vec::new();
        let starts = (0..zone_count).map(|z| PathNode::Zone(ZoneId(z))).chain(
            (0..topo.routers.len())
                .filter(|&r| topo.routers[r].is_path_node())
                .map(|r| PathNode::Router(RouterId(r))),
        );
        for start in starts {
            let idx = engine.index(start);
            if engine.visited[idx] {
                continue;
            }
            roots.push(idx);
            engine.dfs(topo, idx, &mut depth, &mut active);
        }
        for slot in 0..nodes {
            engine.node_loop[slot] = engine.node_loop[slot].map(|l| engine.find(l));
        }
        for slot in 0..topo.interfaces.len() {
            engine.intf_loop[slot] = engine.intf_loop[slot].map(|l| engine.find(l));
        }
        engine.set_distances(topo, &roots);
        engine.check_pathrestrictions(topo, diag);
        debug!(
            roots = roots.len(),
            loops = engine.loop_count(),
            "path graph prepared"
        );
        engine
    }

    fn index(&self, node: PathNode) -> usize {
        match node {
            PathNode::Zone(z) => z.0,
            PathNode::Router(r) => self.zone_count + r.0,
        }
    }

    fn node(&self, idx: usize) -> PathNode {
        if idx < self.zone_count {
            PathNode::Zone(ZoneId(idx))
        } else {
            PathNode::Router(RouterId(idx - self.zone_count))
        }
    }

    fn neighbours(&self, topo: &Topology, idx: usize) -> Vec<(IntfId, usize)> {
        match self.node(idx) {
            PathNode::Zone(z) => topo
                .zone(z)
                .interfaces
                .iter()
                .map(|&i| (i, self.zone_count + topo.intf(i).router.0))
                .collect(),
            PathNode::Router(r) => topo
                .router(r)
                .interfaces
                .iter()
                .filter_map(|&i| topo.intf(i).zone.map(|z| (i, z.0)))
                .collect(),
        }
    }

    fn other_end(&self, topo: &Topology, intf: IntfId, idx: usize) -> usize {
        match self.node(idx) {
            PathNode::Router(_) => topo.intf(intf).zone.map_or(idx, |z| z.0),
            PathNode::Zone(_) => self.zone_count + topo.intf(intf).router.0,
        }
    }

    fn find(&self, mut id: LoopId) -> LoopId {
        while let Some(next) = self.loops[id.0].redirect {
            id = next;
        }
        id
    }

    fn merge(&mut self, a: Option<LoopId>, b: LoopId) -> LoopId {
        let b = self.find(b);
        let Some(a) = a.map(|a| self.find(a)) else {
            return b;
        };
        if a == b {
            return a;
        }
        let (keep, drop) = if (self.loops[a.0].depth, a) <= (self.loops[b.0].depth, b) {
            (a, b)
        } else {
            (b, a)
        };
        self.loops[drop.0].redirect = Some(keep);
        keep
    }

    fn enter(
        &mut self,
        topo: &Topology,
        idx: usize,
        parent: Option<IntfId>,
        level: usize,
        depth: &mut [usize],
        active: &mut [bool],
    ) -> Frame {
        self.visited[idx] = true;
        active[idx] = true;
        depth[idx] = level;
        Frame {
            idx,
            parent,
            neighbours: self.neighbours(topo, idx),
            cursor: 0,
            own: None,
        }
    }

    /// Depth-first search from `root` with an explicit stack.
    ///
    /// A back edge to an active node opens a loop; loops are merged into
    /// the parent frame when a node is left, unless the parent is their exit.
    fn dfs(&mut self, topo: &Topology, root: usize, depth: &mut [usize], active: &mut [bool]) {
        let mut stack = vec![self.enter(topo, root, None, 0, depth, active)];
        while let Some(frame) = stack.last_mut() {
            let Some(&(intf, next)) = frame.neighbours.get(frame.cursor) else {
                let (idx, parent, own) = (frame.idx, frame.parent, frame.own);
                stack.pop();
                active[idx] = false;
                let own = own.map(|l| self.find(l));
                self.node_loop[idx] = own;
                if let (Some(intf), Some(child), Some(up)) = (parent, own, stack.last_mut()) {
                    self.intf_loop[intf.0] = Some(child);
                    if self.loops[child.0].exit != self.node(up.idx) {
                        up.own = Some(self.merge(up.own, child));
                    }
                }
                continue;
            };
            frame.cursor += 1;
            if Some(intf) == frame.parent {
                continue;
            }
            if self.visited[next] {
                if !active[next] {
                    // Back edge seen before from the other side.
                    continue;
                }
                let id = LoopId(self.loops.len());
                self.loops.push(Loop {
                    exit: self.node(next),
                    distance: 0,
                    redirect: None,
                    depth: depth[next],
                });
                self.intf_loop[intf.0] = Some(id);
                frame.own = Some(self.merge(frame.own, id));
                continue;
            }
            let level = depth[frame.idx] + 1;
            self.to_root[next] = Some(intf);
            let child = self.enter(topo, next, Some(intf), level, depth, active);
            stack.push(child);
        }
    }

    fn set_distances(&mut self, topo: &Topology, roots: &[usize]) {
        let mut seen = vec![false; self.visited.len()];
        for &root in roots {
            let mut queue = VecDeque::from([root]);
            seen[root] = true;
            self.distance[root] = 0;
            while let Some(idx) = queue.pop_front() {
                for (_, next) in self.neighbours(topo, idx) {
                    if !seen[next] {
                        seen[next] = true;
                        self.distance[next] = self.distance[idx] + 1;
                        queue.push_back(next);
                    }
                }
            }
        }
        for l in 0..self.loops.len() {
            let exit = self.index(self.loops[l].exit);
            self.loops[l].distance = self.distance[exit];
        }
    }

    fn check_pathrestrictions(&mut self, topo: &Topology, diag: &Diagnostics) {
        for (p, restriction) in topo.pathrestrictions.iter().enumerate() {
            let explicit = restriction.name.starts_with("pathrestriction:");
            let mut kept = Vec::new();
            for &intf in &restriction.elements {
                if self.intf_loop[intf.0].is_some() {
                    kept.push(intf);
                } else if explicit {
                    diag.warning(format!(
                        "Ignoring {} at {}, because it isn't located inside cyclic graph",
                        restriction.name,
                        topo.intf(intf).name
                    ));
                }
            }
            if kept.len() < 2 {
                continue;
            }
            for intf in kept {
                self.restrict[intf.0].push(PathRestrictionId(p));
            }
        }
    }

    /// Path node holding `obj`.
    pub fn node_of(topo: &Topology, obj: Object) -> Option<PathNode> {
        match obj {
            Object::Network(id) => topo.network(id).zone.map(PathNode::Zone),
            Object::Host(id) => topo.network(topo.host(id).network).zone.map(PathNode::Zone),
            Object::Aggregate(id) => Some(PathNode::Zone(topo.aggregate(id).zone)),
            Object::Interface(id) => {
                let intf = topo.intf(id);
                if topo.router(intf.router).is_path_node() {
                    Some(PathNode::Router(intf.router))
                } else {
                    intf.zone.map(PathNode::Zone)
                }
            }
        }
    }

    pub fn node_name(topo: &Topology, node: PathNode) -> &str {
        match node {
            PathNode::Zone(z) => &topo.zone(z).name,
            PathNode::Router(r) => &topo.router(r).name,
        }
    }

    pub fn distance(&self, node: PathNode) -> usize {
        self.distance[self.index(node)]
    }

    /// Loop `node` is a member of; the exit of a loop is not a member.
    pub fn loop_of(&self, node: PathNode) -> Option<LoopId> {
        self.node_loop[self.index(node)]
    }

    pub fn loop_info(&self, id: LoopId) -> &Loop {
        &self.loops[self.find(id).0]
    }

    /// Number of distinct loops after merging.
    pub fn loop_count(&self) -> usize {
        let canonical: HashSet<LoopId> = self.node_loop.iter().flatten().copied().collect();
        canonical.len()
    }

    /// Path restrictions still effective at `intf`.
    pub fn restrictions(&self, intf: IntfId) -> &[PathRestrictionId] {
        &self.restrict[intf.0]
    }

    /// All router hops on valid paths from `from` to `to`.
    pub fn walk(&mut self, topo: &Topology, from: PathNode, to: PathNode) -> Result<Walk, PathError> {
        let (a, b) = (self.index(from), self.index(to));
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let walk = match self.walk_memo.get(&(lo, hi)) {
            Some(cached) => cached.clone(),
            None => {
                let computed = self.compute_walk(topo, lo, hi).map(Rc::new);
                self.walk_memo.insert((lo, hi), computed.clone());
                computed
            }
        }?;
        Ok(if a <= b { (*walk).clone() } else { walk.reversed() })
    }

    /// First interfaces to take from `from` towards `to`.
    pub fn next_hops(&mut self, topo: &Topology, from: PathNode, to: PathNode) -> Result<Vec<IntfId>, PathError> {
        let key = (self.index(from), self.index(to));
        if let Some(cached) = self.next_memo.get(&key) {
            return Ok(cached.clone());
        }
        let first = self.walk(topo, from, to)?.first;
        self.next_memo.insert(key, first.clone());
        Ok(first)
    }

    /// One step towards the root: to the loop exit or along the tree edge.
    fn up(&self, topo: &Topology, idx: usize) -> Option<(Segment, usize)> {
        if let Some(id) = self.node_loop[idx] {
            let exit = self.index(self.loops[id.0].exit);
            return Some((Segment::Loop { id, from: idx, to: exit }, exit));
        }
        let intf = self.to_root[idx]?;
        Some((Segment::Tree(intf), self.other_end(topo, intf, idx)))
    }

    fn common_loop(&self, x: usize, y: usize) -> Option<LoopId> {
        let (lx, ly) = (self.node_loop[x], self.node_loop[y]);
        if lx.is_some() && lx == ly {
            return lx;
        }
        if let Some(l) = ly {
            if self.index(self.loops[l.0].exit) == x {
                return Some(l);
            }
        }
        if let Some(l) = lx {
            if self.index(self.loops[l.0].exit) == y {
                return Some(l);
            }
        }
        None
    }

    fn error(&self, topo: &Topology, a: usize, b: usize, restricted: bool) -> PathError {
        let from = Self::node_name(topo, self.node(a)).to_string();
        let to = Self::node_name(topo, self.node(b)).to_string();
        if restricted {
            PathError::Restricted { from, to }
        } else {
            PathError::NoPath { from, to }
        }
    }

    fn segments(&self, topo: &Topology, a: usize, b: usize) -> Result<Vec<Segment>, PathError> {
        let mut front = Vec::new();
        let mut back = Vec::new();
        let (mut x, mut y) = (a, b);
        while x != y {
            if let Some(id) = self.common_loop(x, y) {
                front.push(Segment::Loop { id, from: x, to: y });
                break;
            }
            let climb_x = self.distance[x] >= self.distance[y];
            let node = if climb_x { x } else { y };
            let Some((segment, next)) = self.up(topo, node) else {
                return Err(self.error(topo, a, b, false));
            };
            if climb_x {
                front.push(segment);
                x = next;
            } else {
                back.push(match segment {
                    Segment::Loop { id, from, to } => Segment::Loop { id, from: to, to: from },
                    tree => tree,
                });
                y = next;
            }
        }
        front.extend(back.into_iter().rev());
        Ok(front)
    }

    fn loop_paths(
        &mut self,
        topo: &Topology,
        id: LoopId,
        from: usize,
        to: usize,
        seed: &BTreeSet<PathRestrictionId>,
    ) -> Rc<LoopPaths> {
        let key = (id, from, to, seed.clone());
        if let Some(cached) = self.loop_memo.get(&key) {
            return Rc::clone(cached);
        }
        let mut found = Vec::new();
        let mut visited = HashSet::from([from]);
        let mut path = Vec::new();
        let mut used: Vec<PathRestrictionId> = seed.iter().copied().collect();
        self.enumerate(topo, id, from, to, &mut visited, &mut path, &mut used, &mut found);

        let mut mandatory: Option<BTreeSet<PathRestrictionId>> = None;
        let mut paths = Vec::new();
        for (path, used) in found {
            mandatory = Some(match mandatory {
                None => used,
                Some(prev) => prev.intersection(&used).copied().collect(),
            });
            paths.push(path);
        }
        let result = Rc::new(LoopPaths {
            paths,
            mandatory: mandatory.unwrap_or_default(),
        });
        self.loop_memo.insert(key, Rc::clone(&result));
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn enumerate(
        &self,
        topo: &Topology,
        id: LoopId,
        idx: usize,
        to: usize,
        visited: &mut HashSet<usize>,
        path: &mut Vec<IntfId>,
        used: &mut Vec<PathRestrictionId>,
        found: &mut Vec<(Vec<IntfId>, BTreeSet<PathRestrictionId>)>,
    ) {
        if idx == to {
            let own = path
                .iter()
                .flat_map(|&i| self.restrict[i.0].iter().copied())
                .collect();
            found.push((path.clone(), own));
            return;
        }
        for (intf, next) in self.neighbours(topo, idx) {
            if self.intf_loop[intf.0] != Some(id) || visited.contains(&next) {
                continue;
            }
            let prs = &self.restrict[intf.0];
            if prs.iter().any(|p| used.contains(p)) {
                continue;
            }
            visited.insert(next);
            path.push(intf);
            used.extend(prs.iter().copied());
            self.enumerate(topo, id, next, to, visited, path, used, found);
            used.truncate(used.len() - prs.len());
            path.pop();
            visited.remove(&next);
        }
    }

    fn compute_walk(&mut self, topo: &Topology, a: usize, b: usize) -> Result<Walk, PathError> {
        if a == b {
            return Ok(Walk::default());
        }
        let segments = self.segments(topo, a, b)?;
        let mut seed = BTreeSet::new();
        let mut alternatives: Vec<(Vec<Vec<IntfId>>, usize)> = Vec::new();
        let mut node = a;
        for segment in segments {
            match segment {
                Segment::Tree(intf) => {
                    node = self.other_end(topo, intf, node);
                    alternatives.push((vec![vec![intf]], node));
                }
                Segment::Loop { id, from, to } => {
                    let paths = self.loop_paths(topo, id, from, to, &seed);
                    if paths.paths.is_empty() {
                        return Err(self.error(topo, a, b, true));
                    }
                    seed.extend(paths.mandatory.iter().copied());
                    node = to;
                    alternatives.push((paths.paths.clone(), to));
                }
            }
        }

        let mut walk = Walk::default();
        let push = |hop: Hop, hops: &mut Vec<Hop>| {
            if !hops.contains(&hop) {
                hops.push(hop);
            }
        };
        let mut node = a;
        let mut arriving: Vec<Option<IntfId>> = vec![None];
        for (paths, end) in &alternatives {
            let firsts = unique(paths.iter().filter_map(|p| p.first().copied()).collect());
            if let PathNode::Router(r) = self.node(node) {
                for &in_intf in &arriving {
                    for &out in &firsts {
                        push(
                            Hop {
                                in_intf,
                                router: r,
                                out_intf: Some(out),
                            },
                            &mut walk.hops,
                        );
                    }
                }
            }
            if walk.first.is_empty() {
                walk.first = firsts;
            }
            for path in paths {
                let mut cur = node;
                for (k, &intf) in path.iter().enumerate() {
                    let next = self.other_end(topo, intf, cur);
                    if let (Some(&out), PathNode::Router(r)) = (path.get(k + 1), self.node(next)) {
                        push(
                            Hop {
                                in_intf: Some(intf),
                                router: r,
                                out_intf: Some(out),
                            },
                            &mut walk.hops,
                        );
                    }
                    cur = next;
                }
            }
            arriving = unique(paths.iter().filter_map(|p| p.last().copied()).collect())
                .into_iter()
                .map(Some)
                .collect();
            node = *end;
        }
        if let PathNode::Router(r) = self.node(node) {
            for &in_intf in &arriving {
                push(
                    Hop {
                        in_intf,
                        router: r,
                        out_intf: None,
                    },
                    &mut walk.hops,
                );
            }
        }
        walk.last = arriving.into_iter().flatten().collect();
        Ok(walk)
    }
}

fn unique(items: Vec<IntfId>) -> Vec<IntfId> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
