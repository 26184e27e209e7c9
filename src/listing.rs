//! The ordered instruction stream of one function body, together with its
//! frame, label index, and catch metadata. See `spec.md` §3/§4.C.

use crate::error::{CodegenResult, Error};
use crate::frame::{Block, Frame, FreeOpt, Part, Variable};
use crate::instruction::Instruction;
use crate::label::Label;
use crate::refs::{RefId, RefManager};
use crate::size::Size;
use cranelift_entity::{EntityRef, SecondaryMap};
use smallvec::SmallVec;
use std::sync::Arc;

/// One instruction plus the labels that point at its first emitted byte.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The instruction.
    pub inst: Instruction,
    /// Labels marked immediately before this instruction was appended.
    pub labels: SmallVec<[Label; 2]>,
}

/// `(exceptionType, resumeLabel)`: one row of a block's catch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchEntry {
    /// The reference identifying the exception type this clause catches.
    pub exception_type: RefId,
    /// Where to resume execution if this clause's type matches.
    pub resume_label: Label,
}

/// A function body: instructions, frame, labels, and catch metadata.
///
/// Entries are appended with [`Listing::push`]; labels queued with
/// [`Listing::queue_label`] attach to the *next* instruction appended, or to
/// the one-past-the-end position if the listing is finalized with pending
/// labels still queued.
pub struct Listing {
    entries: Vec<Entry>,
    pending_labels: SmallVec<[Label; 2]>,
    /// Position (index into `entries`, or `entries.len()` for "past the
    /// end") each label was marked at. `None` until marked.
    marks: SecondaryMap<Label, Option<u32>>,
    next_label: u32,
    frame: Frame,
    refs: Arc<RefManager>,
    catch_table: SecondaryMap<Block, Vec<CatchEntry>>,
    /// Result type of the function, if it returns a value.
    pub result_type: Option<Size>,
    /// Whether this listing implements a member (`this`-taking) function.
    pub is_member_function: bool,
}

impl Listing {
    /// Create an empty listing with just the root block.
    pub fn new() -> Self {
        Listing {
            entries: Vec::new(),
            pending_labels: SmallVec::new(),
            marks: SecondaryMap::new(),
            // Label 0 is reserved for function metadata and never
            // allocated to ordinary IR construction.
            next_label: 1,
            frame: Frame::new(),
            refs: RefManager::new(),
            catch_table: SecondaryMap::new(),
            result_type: None,
            is_member_function: false,
        }
    }

    /// The frame (blocks/parts/variables) of this listing.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Mutable access to the frame, for builder operations.
    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    /// This listing's arena-scoped external reference manager.
    pub fn refs(&self) -> &Arc<RefManager> {
        &self.refs
    }

    /// Allocate a fresh, never-before-used label id.
    pub fn create_label(&mut self) -> Label {
        let l = Label::new(self.next_label as usize);
        self.next_label += 1;
        l
    }

    /// Create a child block of `parent`.
    pub fn create_block(&mut self, parent: Block) -> CodegenResult<Block> {
        self.frame.create_block(parent)
    }

    /// Create a new part chained after `before`.
    pub fn create_part(&mut self, before: Part) -> CodegenResult<Part> {
        self.frame.create_part(before)
    }

    /// Append a local variable to `part`.
    pub fn create_var(
        &mut self,
        part: Part,
        size: Size,
        free_fn: Option<RefId>,
        opt: FreeOpt,
    ) -> CodegenResult<Variable> {
        self.frame.create_var(part, size, free_fn, opt)
    }

    /// Append a parameter to the root block.
    pub fn create_param(&mut self, size: Size) -> Variable {
        self.frame.create_param(size)
    }

    /// Reorder the parameter list.
    pub fn move_param(&mut self, v: Variable, i: usize) -> CodegenResult<()> {
        self.frame.move_param(v, i)
    }

    /// Move a local to a later part within the same block.
    pub fn delay(&mut self, v: Variable, dest: Part) -> CodegenResult<()> {
        self.frame.delay(v, dest)
    }

    /// Queue `label` to be attached to the next instruction appended by
    /// [`Listing::push`].
    pub fn queue_label(&mut self, label: Label) {
        self.pending_labels.push(label);
    }

    /// Append `inst`, attaching any labels queued since the previous push.
    pub fn push(&mut self, inst: Instruction) -> CodegenResult<()> {
        let labels = std::mem::take(&mut self.pending_labels);
        self.mark_labels(&labels, self.entries.len() as u32)?;
        self.entries.push(Entry { inst, labels });
        Ok(())
    }

    fn mark_labels(&mut self, labels: &[Label], pos: u32) -> CodegenResult<()> {
        for &l in labels {
            if self.marks[l].is_some() {
                return Err(Error::DuplicateLabelError(l));
            }
            self.marks[l] = Some(pos);
        }
        Ok(())
    }

    /// Finalize any labels still queued (none appended after them) at the
    /// one-past-the-end position. Must be called before assembly.
    pub fn finish_pending_labels(&mut self) -> CodegenResult<()> {
        let labels = std::mem::take(&mut self.pending_labels);
        self.mark_labels(&labels, self.entries.len() as u32)
    }

    /// The instruction stream.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Mutable access to the instruction stream, for the transform
    /// pipeline.
    pub fn entries_mut(&mut self) -> &mut Vec<Entry> {
        &mut self.entries
    }

    /// The entry index `label` was marked at, erroring if it was never
    /// marked (the referencing check run at emission time).
    pub fn label_position(&self, label: Label) -> CodegenResult<u32> {
        self.marks[label].ok_or(Error::UnusedLabelError(label))
    }

    /// Add `(exception_type, resume_label)` to `block`'s catch table.
    pub fn add_catch(&mut self, block: Block, exception_type: RefId, resume_label: Label) {
        self.catch_table[block].push(CatchEntry {
            exception_type,
            resume_label,
        });
    }

    /// The catch table for `block`.
    pub fn catch_table(&self, block: Block) -> &[CatchEntry] {
        &self.catch_table[block]
    }

    /// True iff unwinding needs to run destructors for at least one
    /// variable (`ehClean`): the frame has any `onException` destructor.
    pub fn eh_clean(&self) -> bool {
        self.frame.exception_handler_needed()
    }

    /// True iff any block declares a catch clause (`ehCatch`).
    pub fn eh_catch(&self) -> bool {
        self.catch_table.values().any(|v| !v.is_empty())
    }

    /// Clone this listing into fresh storage with identical label ids,
    /// frame layout, and catch table — used by the idempotence test
    /// (`spec.md` §8: "Listing.deepCopy produces a listing that yields
    /// byte-identical machine code").
    pub fn deep_copy(&self) -> Listing {
        Listing {
            entries: self.entries.clone(),
            pending_labels: self.pending_labels.clone(),
            marks: self.marks.clone(),
            next_label: self.next_label,
            frame: self.frame.deep_copy(),
            refs: RefManager::new(),
            catch_table: self.catch_table.clone(),
            result_type: self.result_type,
            is_member_function: self.is_member_function,
        }
    }
}

impl Default for Listing {
    fn default() -> Self {
        Self::new()
    }
}
