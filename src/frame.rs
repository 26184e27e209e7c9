//! The lexical-scope tree of a listing: blocks, parts, variables, and
//! parameters. See `spec.md` §3 ("Frame") and §4.C/§4.D.

use crate::error::{CodegenResult, Error};
use crate::refs::RefId;
use crate::size::Size;
use cranelift_entity::{entity_impl, EntityRef, PrimaryMap};

/// A lexical scope; a node in the frame tree. Block `0` is the function's
/// root block and owns the parameter list.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// A sub-range within a block. Each block's first part is implicitly
/// created with the block; additional parts chain forward within the same
/// block to narrow the set of live locals after a point (e.g. after a
/// local's initializer runs).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Part(u32);
entity_impl!(Part, "part");

/// A stack slot: either a local (attached to some `Part`) or a parameter
/// (attached to the root block's part list, in parameter order).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(u32);
entity_impl!(Variable, "var");

bitflags::bitflags! {
    /// Controls when and how a variable's destructor is invoked.
    #[derive(Default)]
    pub struct FreeOpt: u8 {
        /// Call the destructor when an exception unwinds through this
        /// variable's scope.
        const ON_EXCEPTION = 0b0001;
        /// Call the destructor when the enclosing block exits normally.
        const ON_BLOCK_EXIT = 0b0010;
        /// Pass the destructor a pointer to the slot rather than the value.
        /// Mandatory for variables larger than 8 bytes.
        const BY_POINTER = 0b0100;
        /// The variable is not yet live (used while a variable is being
        /// constructed in multiple steps before its destructor is armed).
        const INACTIVE = 0b1000;
    }
}

#[derive(Clone)]
struct BlockData {
    parent: Option<Block>,
    /// The part chain belonging to this block, in creation order; index 0
    /// is the block's own implicit first part.
    parts: Vec<Part>,
}

#[derive(Clone)]
struct PartData {
    block: Block,
    /// Variables declared directly in this part, in declaration order.
    vars: Vec<Variable>,
}

#[derive(Clone)]
struct VarData {
    part: Part,
    size: Size,
    free_fn: Option<RefId>,
    opt: FreeOpt,
}

/// The lexical-scope tree of one listing.
///
/// Blocks form a tree rooted at [`Frame::root`]. Every part belongs to
/// exactly one block. A variable is accessible from part `p` iff the
/// variable's block is `p`'s block or a transitive ancestor of it, and the
/// variable's part precedes or equals the current part within that block's
/// part chain.
#[derive(Clone)]
pub struct Frame {
    blocks: PrimaryMap<Block, BlockData>,
    parts: PrimaryMap<Part, PartData>,
    vars: PrimaryMap<Variable, VarData>,
    /// Parameters, in calling-convention order, attached to the root block.
    params: Vec<Variable>,
}

impl Frame {
    /// Create a frame with just the root block and its first part.
    pub fn new() -> Self {
        let mut blocks = PrimaryMap::new();
        let mut parts = PrimaryMap::new();
        let root_part = parts.push(PartData {
            block: Block::new(0),
            vars: Vec::new(),
        });
        blocks.push(BlockData {
            parent: None,
            parts: vec![root_part],
        });
        Frame {
            blocks,
            parts,
            vars: PrimaryMap::new(),
            params: Vec::new(),
        }
    }

    /// The root block, `block0`.
    pub fn root(&self) -> Block {
        Block::new(0)
    }

    fn block_data(&self, b: Block) -> CodegenResult<&BlockData> {
        self.blocks
            .get(b)
            .ok_or_else(|| Error::FrameError(format!("invalid block {}", b)))
    }

    fn part_data(&self, p: Part) -> CodegenResult<&PartData> {
        self.parts
            .get(p)
            .ok_or_else(|| Error::FrameError(format!("invalid part {}", p)))
    }

    /// Create a new block whose parent is `parent`.
    pub fn create_block(&mut self, parent: Block) -> CodegenResult<Block> {
        self.block_data(parent)?;
        let first_part = self.parts.push(PartData {
            // filled in after the block itself is allocated
            block: Block::new(0),
            vars: Vec::new(),
        });
        let block = self.blocks.push(BlockData {
            parent: Some(parent),
            parts: vec![first_part],
        });
        self.parts[first_part].block = block;
        Ok(block)
    }

    /// Create a new part chained after the last part of `before`'s block.
    pub fn create_part(&mut self, before: Part) -> CodegenResult<Part> {
        let block = self.part_data(before)?.block;
        let part = self.parts.push(PartData {
            block,
            vars: Vec::new(),
        });
        self.blocks[block].parts.push(part);
        Ok(part)
    }

    /// The first (implicit) part of `block`.
    pub fn first_part(&self, block: Block) -> CodegenResult<Part> {
        Ok(self.block_data(block)?.parts[0])
    }

    /// The block owning `part`.
    pub fn block_of(&self, part: Part) -> CodegenResult<Block> {
        Ok(self.part_data(part)?.block)
    }

    /// Append a local variable to `part`. `size` is kept as-is, not baked to
    /// a byte count for any particular target; resolving it to bytes is the
    /// stack-layout pass's job, since the target ISA isn't known yet here.
    pub fn create_var(
        &mut self,
        part: Part,
        size: Size,
        free_fn: Option<RefId>,
        opt: FreeOpt,
    ) -> CodegenResult<Variable> {
        self.part_data(part)?;
        let max_size = size.size32().max(size.size64());
        if max_size > 8 && free_fn.is_some() && !opt.contains(FreeOpt::BY_POINTER) {
            return Err(Error::InvalidValue(format!(
                "variable of size {} must be freed by pointer",
                max_size
            )));
        }
        let v = self.vars.push(VarData {
            part,
            size,
            free_fn,
            opt,
        });
        self.parts[part].vars.push(v);
        Ok(v)
    }

    /// Append a parameter to the root block's parameter list.
    pub fn create_param(&mut self, size: Size) -> Variable {
        let v = self.vars.push(VarData {
            part: self.first_part(self.root()).unwrap(),
            size,
            free_fn: None,
            opt: FreeOpt::empty(),
        });
        self.params.push(v);
        v
    }

    /// Reorder the parameter list so `v` becomes the `i`th parameter.
    pub fn move_param(&mut self, v: Variable, i: usize) -> CodegenResult<()> {
        let pos = self
            .params
            .iter()
            .position(|&p| p == v)
            .ok_or_else(|| Error::FrameError(format!("{} is not a parameter", v)))?;
        if i >= self.params.len() {
            return Err(Error::FrameError("move_param index out of range".into()));
        }
        let val = self.params.remove(pos);
        self.params.insert(i, val);
        Ok(())
    }

    /// Move a local variable `v` to a later part `dest`, within the same
    /// block. Errors if `v` is a parameter, `dest` is in a different block,
    /// or `dest` does not come after `v`'s current part.
    pub fn delay(&mut self, v: Variable, dest: Part) -> CodegenResult<()> {
        if self.params.contains(&v) {
            return Err(Error::FrameError("cannot delay a parameter".into()));
        }
        let cur_part = self.vars[v].part;
        let block = self.part_data(cur_part)?.block;
        let dest_block = self.part_data(dest)?.block;
        if block != dest_block {
            return Err(Error::FrameError(
                "delay target part is in a different block".into(),
            ));
        }
        let chain = &self.blocks[block].parts;
        let cur_idx = chain.iter().position(|&p| p == cur_part).unwrap();
        let dest_idx = chain
            .iter()
            .position(|&p| p == dest)
            .ok_or_else(|| Error::FrameError("delay target part not found".into()))?;
        if dest_idx < cur_idx {
            return Err(Error::FrameError(
                "delay target must not precede the variable's current part".into(),
            ));
        }
        self.vars[v].part = dest;
        self.parts[cur_part].vars.retain(|&x| x != v);
        self.parts[dest].vars.push(v);
        Ok(())
    }

    /// The variable preceding `v` in declaration order, or `None` if `v` is
    /// the first variable reachable from its part chain. Well-founded:
    /// strictly decreases either the in-part index or the part-chain index
    /// on every step, so iterating `prev` always terminates.
    pub fn prev(&self, v: Variable) -> Option<Variable> {
        if let Some(pos) = self.params.iter().position(|&p| p == v) {
            return if pos == 0 {
                None
            } else {
                Some(self.params[pos - 1])
            };
        }
        let part = self.vars[v].part;
        let in_part = self.parts[part]
            .vars
            .iter()
            .position(|&x| x == v)
            .expect("variable indexed in its own part");
        if in_part > 0 {
            return Some(self.parts[part].vars[in_part - 1]);
        }
        // First variable of this part: walk back through earlier parts of
        // the enclosing block for the last variable of a non-empty one.
        let block = self.parts[part].block;
        let chain = &self.blocks[block].parts;
        let part_idx = chain.iter().position(|&p| p == part).unwrap();
        for &earlier in chain[..part_idx].iter().rev() {
            if let Some(&last) = self.parts[earlier].vars.last() {
                return Some(last);
            }
        }
        // Root block's locals fall back to the last parameter.
        if block == self.root() {
            return self.params.last().copied();
        }
        None
    }

    /// True iff `v`'s block is `p`'s block, or a transitive ancestor of it
    /// (through block parents), and `v`'s part does not come after `p`
    /// within their common block's part chain.
    pub fn accessible(&self, v: Variable, p: Part) -> bool {
        let v_block = self.vars[v].part;
        let v_block = match self.parts.get(v_block) {
            Some(d) => d.block,
            None => return false,
        };
        let mut cur_part = p;
        loop {
            let cur_block = match self.parts.get(cur_part) {
                Some(d) => d.block,
                None => return false,
            };
            if cur_block == v_block {
                let chain = &self.blocks[cur_block].parts;
                let v_part = self.vars[v].part;
                let v_idx = chain.iter().position(|&x| x == v_part);
                let p_idx = chain.iter().position(|&x| x == p);
                return matches!((v_idx, p_idx), (Some(a), Some(b)) if a <= b);
            }
            match self.blocks[cur_block].parent {
                Some(parent) => cur_part = self.first_part(parent).unwrap(),
                None => return false,
            }
        }
    }

    /// All variables accessible anywhere within `block`'s own part chain;
    /// for the root block, parameters are appended after the locals.
    pub fn all_vars(&self, block: Block) -> CodegenResult<Vec<Variable>> {
        let data = self.block_data(block)?;
        let mut out = Vec::new();
        for &part in &data.parts {
            out.extend(self.parts[part].vars.iter().copied());
        }
        if block == self.root() {
            out.extend(self.params.iter().copied());
        }
        Ok(out)
    }

    /// True iff any variable anywhere in the frame has a destructor armed
    /// for exception unwinding, in which case the listing requires a DWARF
    /// FDE with a personality routine.
    pub fn exception_handler_needed(&self) -> bool {
        self.vars
            .values()
            .any(|v| v.free_fn.is_some() && v.opt.contains(FreeOpt::ON_EXCEPTION))
    }

    /// The parameter list, in order.
    pub fn params(&self) -> &[Variable] {
        &self.params
    }

    /// The parent of `block`, or `None` for the root.
    pub fn parent(&self, block: Block) -> CodegenResult<Option<Block>> {
        Ok(self.block_data(block)?.parent)
    }

    /// The parts belonging to `block`, in chain order.
    pub fn parts_of(&self, block: Block) -> CodegenResult<&[Part]> {
        Ok(&self.block_data(block)?.parts)
    }

    /// The variables declared directly in `part` (not including parameters
    /// or variables of other parts), in declaration order.
    pub fn vars_in_part(&self, part: Part) -> CodegenResult<&[Variable]> {
        Ok(&self.part_data(part)?.vars)
    }

    /// Total number of blocks in the frame, so callers can enumerate every
    /// block by dense id (`0..block_count()`) without a tree-walk API.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Declared size of `v`, to be resolved to a byte count against a
    /// specific target's pointer width at stack-layout time.
    pub fn var_size(&self, v: Variable) -> Size {
        self.vars[v].size
    }

    /// Declared `FreeOpt` bits of `v`.
    pub fn var_opt(&self, v: Variable) -> FreeOpt {
        self.vars[v].opt
    }

    /// Destructor reference of `v`, if any.
    pub fn var_free_fn(&self, v: Variable) -> Option<RefId> {
        self.vars[v].free_fn
    }

    /// The part `v` is declared in.
    pub fn var_part(&self, v: Variable) -> Part {
        self.vars[v].part
    }

    /// True if `v` is a function parameter rather than a local.
    pub fn is_param(&self, v: Variable) -> bool {
        self.params.contains(&v)
    }

    /// A structural copy with identical block/part/variable ids, used by
    /// `Listing::deep_copy`.
    pub fn deep_copy(&self) -> Frame {
        self.clone()
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::S_INT;

    #[test]
    fn accessible_within_same_part() {
        let mut f = Frame::new();
        let root = f.root();
        let p0 = f.first_part(root).unwrap();
        let v = f.create_var(p0, S_INT, None, FreeOpt::empty()).unwrap();
        assert!(f.accessible(v, p0));
    }

    #[test]
    fn inaccessible_from_sibling_block() {
        let mut f = Frame::new();
        let root = f.root();
        let b1 = f.create_block(root).unwrap();
        let b2 = f.create_block(root).unwrap();
        let p1 = f.first_part(b1).unwrap();
        let p2 = f.first_part(b2).unwrap();
        let v = f.create_var(p1, S_INT, None, FreeOpt::empty()).unwrap();
        assert!(f.accessible(v, p1));
        assert!(!f.accessible(v, p2));
    }

    #[test]
    fn accessible_from_nested_block() {
        let mut f = Frame::new();
        let root = f.root();
        let p0 = f.first_part(root).unwrap();
        let v = f.create_var(p0, S_INT, None, FreeOpt::empty()).unwrap();
        let inner = f.create_block(root).unwrap();
        let pinner = f.first_part(inner).unwrap();
        assert!(f.accessible(v, pinner));
    }

    #[test]
    fn later_part_sees_earlier_vars_not_vice_versa() {
        let mut f = Frame::new();
        let root = f.root();
        let p0 = f.first_part(root).unwrap();
        let v0 = f.create_var(p0, S_INT, None, FreeOpt::empty()).unwrap();
        let p1 = f.create_part(p0).unwrap();
        let v1 = f.create_var(p1, S_INT, None, FreeOpt::empty()).unwrap();
        assert!(f.accessible(v0, p1));
        assert!(!f.accessible(v1, p0));
    }

    #[test]
    fn prev_terminates_and_is_well_founded() {
        let mut f = Frame::new();
        let root = f.root();
        f.create_param(S_INT);
        let p0 = f.first_part(root).unwrap();
        let v0 = f.create_var(p0, S_INT, None, FreeOpt::empty()).unwrap();
        let p1 = f.create_part(p0).unwrap();
        let v1 = f.create_var(p1, S_INT, None, FreeOpt::empty()).unwrap();

        let mut cur = Some(v1);
        let mut steps = 0;
        let mut seen = Vec::new();
        while let Some(v) = cur {
            seen.push(v);
            cur = f.prev(v);
            steps += 1;
            assert!(steps < 100, "prev did not terminate");
        }
        assert_eq!(seen, vec![v1, v0]);
    }

    #[test]
    fn large_value_without_by_pointer_rejected() {
        let mut f = Frame::new();
        let root = f.root();
        let p0 = f.first_part(root).unwrap();
        let big = Size::scalar(16);
        let err = f.create_var(p0, big, Some(RefId::new(0)), FreeOpt::empty());
        assert!(err.is_err());
        let ok = f.create_var(p0, big, Some(RefId::new(0)), FreeOpt::BY_POINTER);
        assert!(ok.is_ok());
    }
}
