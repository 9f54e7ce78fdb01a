//! Retained instruction graph
//!
//! Groups and instructions live in arenas keyed by their stable ids; a
//! group's children are an ordered list of ids and traversal order is render
//! order. Every mutation marks its group dirty and moves the group to a new
//! revision. Nothing compiles here: dirty groups accumulate until the next
//! compile pass.

pub mod instruction;
pub mod mutation;

pub use instruction::{
    BufferReference, Instruction, Primitive, ShaderSource, StateChange, TextureRef,
};
pub use mutation::{GraphWriter, Mutation, MutationBatch, MutationQueue};

use std::collections::{BTreeSet, HashMap};
use tracing::trace;
use vellum_core::{Color, GraphError, GroupId, IdAllocator, InstructionId};

type Result<T> = std::result::Result<T, GraphError>;

/// Entry in a group's child list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Child {
    Instruction(InstructionId),
    Group(GroupId),
}

/// Offscreen render target of a group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffscreenTarget {
    pub width: u32,
    pub height: u32,
    /// Cleared to this color before the group renders, kept otherwise
    pub clear: Option<Color>,
    pub stencil: bool,
}

#[derive(Debug, Clone)]
pub struct GroupNode {
    children: Vec<Child>,
    parent: Option<GroupId>,
    revision: u64,
    target: Option<OffscreenTarget>,
}

impl GroupNode {
    fn new(target: Option<OffscreenTarget>, revision: u64) -> Self {
        Self {
            children: Vec::new(),
            parent: None,
            revision,
            target,
        }
    }

    pub fn children(&self) -> &[Child] {
        &self.children
    }

    pub fn parent(&self) -> Option<GroupId> {
        self.parent
    }

    /// Revision of the last mutation of this group
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn target(&self) -> Option<OffscreenTarget> {
        self.target
    }
}

#[derive(Debug, Clone)]
pub struct InstructionNode {
    instruction: Instruction,
    group: GroupId,
    dirty: bool,
}

impl InstructionNode {
    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Changed since the last compile pass
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Arena of groups and instructions under a single root
#[derive(Debug)]
pub struct InstructionGraph {
    ids: IdAllocator,
    root: GroupId,
    groups: HashMap<GroupId, GroupNode>,
    instructions: HashMap<InstructionId, InstructionNode>,
    revision: u64,
    dirty: BTreeSet<GroupId>,
    topology_changed: bool,
}

impl InstructionGraph {
    pub fn new() -> Self {
        Self::with_allocator(IdAllocator::new())
    }

    /// Graph drawing ids from a shared allocator
    pub fn with_allocator(ids: IdAllocator) -> Self {
        let root = ids.next_group();
        let mut groups = HashMap::new();
        groups.insert(root, GroupNode::new(None, 1));
        let mut dirty = BTreeSet::new();
        dirty.insert(root);

        Self {
            ids,
            root,
            groups,
            instructions: HashMap::new(),
            revision: 1,
            dirty,
            topology_changed: true,
        }
    }

    pub fn root(&self) -> GroupId {
        self.root
    }

    pub fn allocator(&self) -> &IdAllocator {
        &self.ids
    }

    /// Revision of the most recent mutation anywhere in the graph
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self, group: GroupId) {
        self.revision += 1;
        if let Some(node) = self.groups.get_mut(&group) {
            node.revision = self.revision;
        }
        self.dirty.insert(group);
    }

    fn group_mut(&mut self, group: GroupId) -> Result<&mut GroupNode> {
        self.groups
            .get_mut(&group)
            .ok_or(GraphError::UnknownGroup(group))
    }

    fn check_free_id(&self, id: u64) -> Result<()> {
        if self.groups.contains_key(&GroupId(id)) || self.instructions.contains_key(&InstructionId(id)) {
            Err(GraphError::DuplicateId(id))
        } else {
            Ok(())
        }
    }

    // Groups

    /// New detached group
    pub fn create_group(&mut self) -> GroupId {
        let id = self.ids.next_group();
        self.insert_group(id, None);
        id
    }

    /// New detached group that renders into its own target
    pub fn create_offscreen_group(
        &mut self,
        width: u32,
        height: u32,
        clear: Option<Color>,
        stencil: bool,
    ) -> GroupId {
        let id = self.ids.next_group();
        self.insert_group(
            id,
            Some(OffscreenTarget {
                width,
                height,
                clear,
                stencil,
            }),
        );
        id
    }

    /// Create a group under an id allocated elsewhere
    pub fn create_group_with_id(
        &mut self,
        id: GroupId,
        target: Option<OffscreenTarget>,
    ) -> Result<()> {
        self.check_free_id(id.0)?;
        self.insert_group(id, target);
        Ok(())
    }

    fn insert_group(&mut self, id: GroupId, target: Option<OffscreenTarget>) {
        self.revision += 1;
        self.groups.insert(id, GroupNode::new(target, self.revision));
        self.dirty.insert(id);
        trace!("Created {}", id);
    }

    /// Attach `child` under `parent`, appended or at `index`
    pub fn attach_group(
        &mut self,
        parent: GroupId,
        child: GroupId,
        index: Option<usize>,
    ) -> Result<()> {
        if child == self.root {
            return Err(GraphError::RootGroup("attached"));
        }
        let child_node = self.groups.get(&child).ok_or(GraphError::UnknownGroup(child))?;
        if let Some(current) = child_node.parent {
            return Err(GraphError::AlreadyAttached {
                child,
                parent: current,
            });
        }
        let parent_node = self.groups.get(&parent).ok_or(GraphError::UnknownGroup(parent))?;
        let len = parent_node.children.len();
        let index = index.unwrap_or(len);
        if index > len {
            return Err(GraphError::IndexOutOfRange {
                group: parent,
                index,
                len,
            });
        }
        if self.ancestors(parent).any(|ancestor| ancestor == child) {
            return Err(GraphError::Cycle { parent, child });
        }

        self.group_mut(parent)?.children.insert(index, Child::Group(child));
        self.group_mut(child)?.parent = Some(parent);
        self.topology_changed = true;
        self.touch(parent);
        self.dirty.insert(child);
        Ok(())
    }

    pub fn detach_group(&mut self, parent: GroupId, child: GroupId) -> Result<()> {
        let child_node = self.groups.get(&child).ok_or(GraphError::UnknownGroup(child))?;
        if child_node.parent != Some(parent) {
            return Err(GraphError::NotAttached { child, parent });
        }
        let parent_node = self.group_mut(parent)?;
        parent_node.children.retain(|c| *c != Child::Group(child));
        self.group_mut(child)?.parent = None;
        self.topology_changed = true;
        self.touch(parent);
        Ok(())
    }

    /// Remove a group and everything under it, returning the removed
    /// instructions so their resources can be released
    pub fn destroy_group(&mut self, group: GroupId) -> Result<Vec<Instruction>> {
        if group == self.root {
            return Err(GraphError::RootGroup("destroyed"));
        }
        let parent = self
            .groups
            .get(&group)
            .ok_or(GraphError::UnknownGroup(group))?
            .parent;
        if let Some(parent) = parent {
            self.detach_group(parent, group)?;
        }

        let mut removed = Vec::new();
        let mut stack = vec![group];
        while let Some(id) = stack.pop() {
            let Some(node) = self.groups.remove(&id) else {
                continue;
            };
            self.dirty.remove(&id);
            for child in node.children {
                match child {
                    Child::Group(nested) => stack.push(nested),
                    Child::Instruction(instruction) => {
                        if let Some(node) = self.instructions.remove(&instruction) {
                            removed.push(node.instruction);
                        }
                    }
                }
            }
        }
        self.topology_changed = true;
        trace!("Destroyed {} with {} instructions", group, removed.len());
        Ok(removed)
    }

    /// Resize an offscreen group's target
    pub fn set_target_size(&mut self, group: GroupId, width: u32, height: u32) -> Result<()> {
        let node = self.group_mut(group)?;
        let target = node.target.as_mut().ok_or(GraphError::NotOffscreen(group))?;
        target.width = width;
        target.height = height;
        self.touch(group);
        Ok(())
    }

    fn ancestors(&self, group: GroupId) -> impl Iterator<Item = GroupId> + '_ {
        std::iter::successors(Some(group), move |id| {
            self.groups.get(id).and_then(|node| node.parent)
        })
    }

    // Instructions

    pub fn add_instruction(
        &mut self,
        group: GroupId,
        instruction: Instruction,
    ) -> Result<InstructionId> {
        let id = self.ids.next_instruction();
        self.place(group, id, instruction, None)?;
        Ok(id)
    }

    /// Append under an id allocated elsewhere
    pub fn add_instruction_with_id(
        &mut self,
        group: GroupId,
        id: InstructionId,
        instruction: Instruction,
        index: Option<usize>,
    ) -> Result<()> {
        self.check_free_id(id.0)?;
        self.place(group, id, instruction, index)
    }

    pub fn insert_instruction(
        &mut self,
        group: GroupId,
        index: usize,
        instruction: Instruction,
    ) -> Result<InstructionId> {
        let id = self.ids.next_instruction();
        self.place(group, id, instruction, Some(index))?;
        Ok(id)
    }

    fn place(
        &mut self,
        group: GroupId,
        id: InstructionId,
        instruction: Instruction,
        index: Option<usize>,
    ) -> Result<()> {
        let node = self.group_mut(group)?;
        let len = node.children.len();
        let index = index.unwrap_or(len);
        if index > len {
            return Err(GraphError::IndexOutOfRange { group, index, len });
        }
        node.children.insert(index, Child::Instruction(id));
        self.instructions.insert(
            id,
            InstructionNode {
                instruction,
                group,
                dirty: true,
            },
        );
        self.touch(group);
        Ok(())
    }

    pub fn remove_instruction(&mut self, group: GroupId, id: InstructionId) -> Result<Instruction> {
        let owner = self
            .instructions
            .get(&id)
            .ok_or(GraphError::UnknownInstruction(id))?
            .group;
        if owner != group {
            return Err(GraphError::NotInGroup {
                group,
                instruction: id,
            });
        }
        self.group_mut(group)?
            .children
            .retain(|c| *c != Child::Instruction(id));
        let node = self
            .instructions
            .remove(&id)
            .ok_or(GraphError::UnknownInstruction(id))?;
        self.touch(group);
        Ok(node.instruction)
    }

    /// Edit an instruction in place
    pub fn mutate<R>(&mut self, id: InstructionId, f: impl FnOnce(&mut Instruction) -> R) -> Result<R> {
        let node = self
            .instructions
            .get_mut(&id)
            .ok_or(GraphError::UnknownInstruction(id))?;
        let result = f(&mut node.instruction);
        node.dirty = true;
        let group = node.group;
        self.touch(group);
        Ok(result)
    }

    /// Swap in a new instruction, returning the old one
    pub fn replace(&mut self, id: InstructionId, instruction: Instruction) -> Result<Instruction> {
        self.mutate(id, |slot| std::mem::replace(slot, instruction))
    }

    // Queries

    pub fn instruction(&self, id: InstructionId) -> Option<&Instruction> {
        self.instructions.get(&id).map(|node| &node.instruction)
    }

    pub fn instruction_node(&self, id: InstructionId) -> Option<&InstructionNode> {
        self.instructions.get(&id)
    }

    pub fn group(&self, id: GroupId) -> Option<&GroupNode> {
        self.groups.get(&id)
    }

    pub fn contains_group(&self, id: GroupId) -> bool {
        self.groups.contains_key(&id)
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Depth below the root, `None` for groups not attached under it
    pub fn depth(&self, group: GroupId) -> Option<usize> {
        let mut depth = 0;
        let mut last = group;
        for ancestor in self.ancestors(group).skip(1) {
            depth += 1;
            last = ancestor;
        }
        (last == self.root && self.groups.contains_key(&group)).then_some(depth)
    }

    /// Every group reachable from the root, parents first
    pub fn reachable_groups(&self) -> Vec<GroupId> {
        let mut order = vec![self.root];
        let mut next = 0;
        while next < order.len() {
            if let Some(node) = self.groups.get(&order[next]) {
                order.extend(node.children.iter().filter_map(|child| match child {
                    Child::Group(id) => Some(*id),
                    Child::Instruction(_) => None,
                }));
            }
            next += 1;
        }
        order
    }

    pub fn dirty_groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.dirty.iter().copied()
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Whether groups were attached, detached or destroyed since the last pass
    pub fn topology_changed(&self) -> bool {
        self.topology_changed
    }

    /// Mark every group dirty, forcing a full rebuild
    pub fn mark_all_dirty(&mut self) {
        let ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for id in ids {
            self.touch(id);
        }
        for node in self.instructions.values_mut() {
            node.dirty = true;
        }
        self.topology_changed = true;
    }

    /// Called by the compiler after a successful pass
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
        self.topology_changed = false;
        for node in self.instructions.values_mut() {
            node.dirty = false;
        }
    }
}

impl Default for InstructionGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vellum_core::Rect;

    fn rect() -> Instruction {
        Instruction::rectangle(Rect::new(0.0, 0.0, 10.0, 10.0))
    }

    #[test]
    fn test_mutations_mark_group_dirty_and_bump_revision() {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        graph.clear_dirty();

        let before = graph.group(root).unwrap().revision();
        let id = graph.add_instruction(root, rect()).unwrap();
        let added = graph.group(root).unwrap().revision();
        assert!(added > before);
        assert_eq!(graph.dirty_groups().collect::<Vec<_>>(), vec![root]);
        assert!(graph.instruction_node(id).unwrap().is_dirty());

        graph.clear_dirty();
        graph.mutate(id, |_| ()).unwrap();
        assert!(graph.group(root).unwrap().revision() > added);
        assert!(graph.has_dirty());
    }

    #[test]
    fn test_insert_and_remove_keep_order() {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let a = graph.add_instruction(root, rect()).unwrap();
        let c = graph.add_instruction(root, rect()).unwrap();
        let b = graph.insert_instruction(root, 1, rect()).unwrap();

        assert_eq!(
            graph.group(root).unwrap().children(),
            &[Child::Instruction(a), Child::Instruction(b), Child::Instruction(c)]
        );

        graph.remove_instruction(root, b).unwrap();
        assert_eq!(
            graph.group(root).unwrap().children(),
            &[Child::Instruction(a), Child::Instruction(c)]
        );
        assert_eq!(
            graph.insert_instruction(root, 5, rect()),
            Err(GraphError::IndexOutOfRange {
                group: root,
                index: 5,
                len: 2
            })
        );
    }

    #[test]
    fn test_remove_from_wrong_group() {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let other = graph.create_group();
        let id = graph.add_instruction(other, rect()).unwrap();

        assert_eq!(
            graph.remove_instruction(root, id),
            Err(GraphError::NotInGroup {
                group: root,
                instruction: id
            })
        );
    }

    #[test]
    fn test_attach_rejects_cycles_and_second_parent() {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let outer = graph.create_group();
        let inner = graph.create_group();

        graph.attach_group(root, outer, None).unwrap();
        graph.attach_group(outer, inner, None).unwrap();

        assert_eq!(
            graph.attach_group(root, inner, None),
            Err(GraphError::AlreadyAttached {
                child: inner,
                parent: outer
            })
        );
        graph.detach_group(root, outer).unwrap();
        assert_eq!(
            graph.attach_group(inner, outer, None),
            Err(GraphError::Cycle {
                parent: inner,
                child: outer
            })
        );
        assert_eq!(
            graph.attach_group(outer, root, None),
            Err(GraphError::RootGroup("attached"))
        );
    }

    #[test]
    fn test_depth_and_reachability() {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let outer = graph.create_group();
        let inner = graph.create_group();
        graph.attach_group(outer, inner, None).unwrap();

        assert_eq!(graph.depth(inner), None);
        graph.attach_group(root, outer, None).unwrap();
        assert_eq!(graph.depth(root), Some(0));
        assert_eq!(graph.depth(inner), Some(2));
        assert_eq!(graph.reachable_groups(), vec![root, outer, inner]);
    }

    #[test]
    fn test_destroy_group_returns_instructions() {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let outer = graph.create_group();
        let inner = graph.create_group();
        graph.attach_group(root, outer, None).unwrap();
        graph.attach_group(outer, inner, None).unwrap();
        graph.add_instruction(outer, rect()).unwrap();
        graph.add_instruction(inner, Instruction::color(Color::RED)).unwrap();

        let removed = graph.destroy_group(outer).unwrap();

        assert_eq!(removed.len(), 2);
        assert_eq!(graph.group_count(), 1);
        assert_eq!(graph.instruction_count(), 0);
        assert!(graph.group(root).unwrap().children().is_empty());
        assert_eq!(graph.destroy_group(root), Err(GraphError::RootGroup("destroyed")));
    }

    #[test]
    fn test_replace_returns_previous_instruction() {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let id = graph.add_instruction(root, Instruction::color(Color::RED)).unwrap();

        let old = graph.replace(id, Instruction::color(Color::BLUE)).unwrap();
        assert_eq!(old, Instruction::color(Color::RED));
        assert_eq!(graph.instruction(id), Some(&Instruction::color(Color::BLUE)));
    }

    #[test]
    fn test_ids_from_shared_allocator() {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let ids = graph.allocator().clone();
        let id = ids.next_instruction();

        graph.add_instruction_with_id(root, id, rect(), None).unwrap();
        assert_eq!(
            graph.add_instruction_with_id(root, id, rect(), None),
            Err(GraphError::DuplicateId(id.0))
        );
    }

    #[test]
    fn test_set_target_size_requires_offscreen_group() {
        let mut graph = InstructionGraph::new();
        let plain = graph.create_group();
        let offscreen = graph.create_offscreen_group(64, 64, None, false);

        graph.set_target_size(offscreen, 128, 32).unwrap();
        let target = graph.group(offscreen).unwrap().target().unwrap();
        assert_eq!((target.width, target.height), (128, 32));
        assert_eq!(
            graph.set_target_size(plain, 1, 1),
            Err(GraphError::NotOffscreen(plain))
        );
    }
}
