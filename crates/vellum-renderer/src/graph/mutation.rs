//! Cross-thread staging of graph mutations
//!
//! Producer threads hold a [`GraphWriter`], name new groups and instructions
//! from the shared [`IdAllocator`], record them in a [`MutationBatch`] and
//! submit it. The GPU thread drains the [`MutationQueue`] at the frame
//! boundary and applies each batch in submission order.

use super::{Instruction, InstructionGraph, OffscreenTarget};
use crate::handles::GpuResourceHandle;
use crossbeam::channel::{self, Receiver, Sender};
use smallvec::SmallVec;
use vellum_core::{Color, GraphError, GroupId, IdAllocator, InstructionId};

/// One recorded graph mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateGroup {
        id: GroupId,
        target: Option<OffscreenTarget>,
    },
    AttachGroup {
        parent: GroupId,
        child: GroupId,
        index: Option<usize>,
    },
    DetachGroup {
        parent: GroupId,
        child: GroupId,
    },
    DestroyGroup(GroupId),
    AddInstruction {
        group: GroupId,
        id: InstructionId,
        instruction: Instruction,
        index: Option<usize>,
    },
    RemoveInstruction {
        group: GroupId,
        id: InstructionId,
    },
    Replace {
        id: InstructionId,
        instruction: Instruction,
    },
    SetTargetSize {
        group: GroupId,
        width: u32,
        height: u32,
    },
}

impl Mutation {
    /// Resources the graph will hold once this mutation is applied
    pub fn added_resources(&self) -> SmallVec<[GpuResourceHandle; 2]> {
        match self {
            Mutation::AddInstruction { instruction, .. } | Mutation::Replace { instruction, .. } => {
                instruction.resources()
            }
            _ => SmallVec::new(),
        }
    }

    /// Apply to `graph`, returning the instructions the mutation displaced
    pub fn apply(self, graph: &mut InstructionGraph) -> Result<Vec<Instruction>, GraphError> {
        match self {
            Mutation::CreateGroup { id, target } => {
                graph.create_group_with_id(id, target)?;
                Ok(Vec::new())
            }
            Mutation::AttachGroup {
                parent,
                child,
                index,
            } => {
                graph.attach_group(parent, child, index)?;
                Ok(Vec::new())
            }
            Mutation::DetachGroup { parent, child } => {
                graph.detach_group(parent, child)?;
                Ok(Vec::new())
            }
            Mutation::DestroyGroup(group) => graph.destroy_group(group),
            Mutation::AddInstruction {
                group,
                id,
                instruction,
                index,
            } => {
                graph.add_instruction_with_id(group, id, instruction, index)?;
                Ok(Vec::new())
            }
            Mutation::RemoveInstruction { group, id } => {
                Ok(vec![graph.remove_instruction(group, id)?])
            }
            Mutation::Replace { id, instruction } => Ok(vec![graph.replace(id, instruction)?]),
            Mutation::SetTargetSize {
                group,
                width,
                height,
            } => {
                graph.set_target_size(group, width, height)?;
                Ok(Vec::new())
            }
        }
    }
}

/// Ordered mutations submitted together
#[derive(Debug, Clone)]
pub struct MutationBatch {
    ids: IdAllocator,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(ids: IdAllocator) -> Self {
        Self {
            ids,
            mutations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn push(&mut self, mutation: Mutation) -> &mut Self {
        self.mutations.push(mutation);
        self
    }

    pub fn create_group(&mut self) -> GroupId {
        let id = self.ids.next_group();
        self.push(Mutation::CreateGroup { id, target: None });
        id
    }

    pub fn create_offscreen_group(
        &mut self,
        width: u32,
        height: u32,
        clear: Option<Color>,
        stencil: bool,
    ) -> GroupId {
        let id = self.ids.next_group();
        self.push(Mutation::CreateGroup {
            id,
            target: Some(OffscreenTarget {
                width,
                height,
                clear,
                stencil,
            }),
        });
        id
    }

    pub fn attach_group(&mut self, parent: GroupId, child: GroupId) -> &mut Self {
        self.push(Mutation::AttachGroup {
            parent,
            child,
            index: None,
        })
    }

    pub fn detach_group(&mut self, parent: GroupId, child: GroupId) -> &mut Self {
        self.push(Mutation::DetachGroup { parent, child })
    }

    pub fn destroy_group(&mut self, group: GroupId) -> &mut Self {
        self.push(Mutation::DestroyGroup(group))
    }

    pub fn add_instruction(&mut self, group: GroupId, instruction: Instruction) -> InstructionId {
        let id = self.ids.next_instruction();
        self.push(Mutation::AddInstruction {
            group,
            id,
            instruction,
            index: None,
        });
        id
    }

    pub fn insert_instruction(
        &mut self,
        group: GroupId,
        index: usize,
        instruction: Instruction,
    ) -> InstructionId {
        let id = self.ids.next_instruction();
        self.push(Mutation::AddInstruction {
            group,
            id,
            instruction,
            index: Some(index),
        });
        id
    }

    pub fn remove_instruction(&mut self, group: GroupId, id: InstructionId) -> &mut Self {
        self.push(Mutation::RemoveInstruction { group, id })
    }

    pub fn replace(&mut self, id: InstructionId, instruction: Instruction) -> &mut Self {
        self.push(Mutation::Replace { id, instruction })
    }

    pub fn set_target_size(&mut self, group: GroupId, width: u32, height: u32) -> &mut Self {
        self.push(Mutation::SetTargetSize {
            group,
            width,
            height,
        })
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// Cloneable handle for producers on other threads
#[derive(Debug, Clone)]
pub struct GraphWriter {
    ids: IdAllocator,
    root: GroupId,
    sender: Sender<MutationBatch>,
}

impl GraphWriter {
    pub fn root(&self) -> GroupId {
        self.root
    }

    /// Empty batch naming ids from the graph's allocator
    pub fn batch(&self) -> MutationBatch {
        MutationBatch::new(self.ids.clone())
    }

    pub fn submit(&self, batch: MutationBatch) -> Result<(), GraphError> {
        self.sender.send(batch).map_err(|_| GraphError::QueueClosed)
    }
}

/// Receiving end drained on the GPU thread
#[derive(Debug)]
pub struct MutationQueue {
    sender: Sender<MutationBatch>,
    receiver: Receiver<MutationBatch>,
}

impl MutationQueue {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self { sender, receiver }
    }

    pub fn writer(&self, graph: &InstructionGraph) -> GraphWriter {
        GraphWriter {
            ids: graph.allocator().clone(),
            root: graph.root(),
            sender: self.sender.clone(),
        }
    }

    /// Batches submitted so far, oldest first
    pub fn drain(&self) -> Vec<MutationBatch> {
        self.receiver.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Child;
    use vellum_core::Rect;

    #[test]
    fn test_batches_from_threads_apply_in_order() {
        let mut graph = InstructionGraph::new();
        let queue = MutationQueue::new();
        let writer = queue.writer(&graph);
        let local = graph.add_instruction(graph.root(), Instruction::color(Color::RED)).unwrap();

        let (group, rect) = std::thread::spawn(move || {
            let mut batch = writer.batch();
            let group = batch.create_group();
            let rect = batch.add_instruction(group, Instruction::rectangle(Rect::new(0.0, 0.0, 4.0, 4.0)));
            batch.attach_group(writer.root(), group);
            writer.submit(batch).unwrap();
            (group, rect)
        })
        .join()
        .unwrap();

        assert_eq!(queue.pending(), 1);
        for batch in queue.drain() {
            for mutation in batch.into_mutations() {
                mutation.apply(&mut graph).unwrap();
            }
        }

        assert_ne!(rect, local);
        assert_eq!(
            graph.group(graph.root()).unwrap().children(),
            &[Child::Instruction(local), Child::Group(group)]
        );
        assert_eq!(graph.instruction_node(rect).unwrap().group(), group);
    }

    #[test]
    fn test_submit_after_queue_dropped() {
        let graph = InstructionGraph::new();
        let queue = MutationQueue::new();
        let writer = queue.writer(&graph);
        drop(queue);

        assert_eq!(writer.submit(writer.batch()), Err(GraphError::QueueClosed));
    }

    #[test]
    fn test_remove_returns_displaced_instruction() {
        let mut graph = InstructionGraph::new();
        let root = graph.root();
        let id = graph.add_instruction(root, Instruction::color(Color::RED)).unwrap();

        let displaced = Mutation::RemoveInstruction { group: root, id }
            .apply(&mut graph)
            .unwrap();
        assert_eq!(displaced, vec![Instruction::color(Color::RED)]);
    }
}
