//! Exception-handler frames.
//!
//! Each `Try` pushes an EHFrame record allocated from the engine-internal
//! region. Frames form a stack linked innermost-first and are recycled through
//! a free list when popped. A frame's gosub stack (return addresses pushed by
//! `Gosub` and consumed by `Retsub`) is a linked list of 8-byte internal
//! nodes.
//!
//! Resolution of a throw against the innermost frame of the current
//! activation:
//!
//! | state     | with catch       | finally only               | neither |
//! |-----------|------------------|----------------------------|---------|
//! | Idle      | enter catch      | enter finally, pending     | pop     |
//! | InCatch   | finally, pending | finally, pending           | pop     |
//! | Raised    | pop              | pop                        | pop     |
//! | InFinally | pop              | pop                        | pop     |

use super::error::FatalError;
use super::heap::Heap;
use super::value::Value;

const FRAME_SIZE: u32 = 48;
const NODE_SIZE: u32 = 8;

const F_OWNER: u32 = 0;
const F_STATE: u32 = 4;
const F_STACK_DEPTH: u32 = 8;
const F_TRY_PC: u32 = 12;
const F_CATCH_PC: u32 = 16;
const F_FINALLY_PC: u32 = 20;
const F_GOSUB: u32 = 24;
const F_NEXT: u32 = 28;
const F_THROWN: u32 = 32;
const F_ENV: u32 = 40;

const N_RETURN_PC: u32 = 0;
const N_NEXT: u32 = 4;

const NO_PC: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EhState {
    Idle = 0,
    Raised = 1,
    InCatch = 2,
    InFinally = 3,
}

impl EhState {
    fn from_u8(b: u8) -> EhState {
        match b {
            1 => EhState::Raised,
            2 => EhState::InCatch,
            3 => EhState::InFinally,
            _ => EhState::Idle,
        }
    }
}

/// Where control goes after a throw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    /// Resume at `pc` after truncating the operand stack to `stack_depth` and
    /// restoring `env`. The frame now owns the thrown value.
    Handler { pc: usize, stack_depth: usize, env: Value },
    /// No handler in this activation. The value is handed back to the caller.
    Unhandled(Value),
}

/// Outcome of `Retsub`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetsubAction {
    Return(usize),
    /// The finally block ran for an exception; it continues outward. The
    /// frame has been popped and the caller owns the value.
    Rethrow(Value),
}

/// The handler-frame stack of one engine.
#[derive(Debug, Default)]
pub struct EhStack {
    /// Innermost frame, 0 when empty
    top: u32,
    /// Recycled frame records
    free: u32,
    depth: usize,
    frames_allocated: usize,
}

impl EhStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Frame records ever taken from the internal region.
    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    // -------------------------------------------------------------------------
    // Record access
    // -------------------------------------------------------------------------

    fn r32(heap: &Heap, at: u32) -> u32 {
        heap.arena().internal().read_u32(at)
    }

    fn w32(heap: &mut Heap, at: u32, v: u32) {
        heap.arena_mut().internal_mut().write_u32(at, v);
    }

    fn word(heap: &Heap, at: u32) -> Value {
        Value::from_bits(heap.arena().internal().read_u64(at)).unwrap_or(Value::NONE)
    }

    fn set_word(heap: &mut Heap, at: u32, v: Value) {
        heap.arena_mut().internal_mut().write_u64(at, v.bits());
    }

    fn state_of(heap: &Heap, frame: u32) -> EhState {
        EhState::from_u8(heap.arena().internal().read_u8(frame + F_STATE))
    }

    fn set_state(heap: &mut Heap, frame: u32, state: EhState) {
        heap.arena_mut().internal_mut().write_u8(frame + F_STATE, state as u8);
    }

    fn pc(heap: &Heap, at: u32) -> Option<usize> {
        let pc = Self::r32(heap, at);
        (pc != NO_PC).then_some(pc as usize)
    }

    /// State of the innermost frame.
    pub fn state(&self, heap: &Heap) -> Option<EhState> {
        (self.top != 0).then(|| Self::state_of(heap, self.top))
    }

    /// Program counter of the innermost frame's `Try`.
    pub fn try_pc(&self, heap: &Heap) -> Option<usize> {
        (self.top != 0).then(|| Self::r32(heap, self.top + F_TRY_PC) as usize)
    }

    fn top_for(&self, heap: &Heap, owner: usize) -> Result<u32, FatalError> {
        if self.top == 0 || Self::r32(heap, self.top + F_OWNER) as usize != owner {
            return Err(FatalError::HandlerStack("no handler frame in this activation"));
        }
        Ok(self.top)
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// `Try`: push an Idle frame.
    #[allow(clippy::too_many_arguments)]
    pub fn enter_try(
        &mut self,
        heap: &mut Heap,
        owner: usize,
        try_pc: usize,
        catch_pc: Option<usize>,
        finally_pc: Option<usize>,
        stack_depth: usize,
        env: Value,
    ) -> Result<(), FatalError> {
        let frame = if self.free != 0 {
            let frame = self.free;
            self.free = Self::r32(heap, frame + F_NEXT);
            heap.arena_mut().internal_mut().slice_mut(frame, FRAME_SIZE).fill(0);
            frame
        } else {
            self.frames_allocated += 1;
            heap.arena_mut().alloc_internal(FRAME_SIZE)?
        };
        let as_pc = |pc: Option<usize>| pc.map_or(NO_PC, |pc| pc as u32);
        Self::w32(heap, frame + F_OWNER, owner as u32);
        Self::set_state(heap, frame, EhState::Idle);
        Self::w32(heap, frame + F_STACK_DEPTH, stack_depth as u32);
        Self::w32(heap, frame + F_TRY_PC, try_pc as u32);
        Self::w32(heap, frame + F_CATCH_PC, as_pc(catch_pc));
        Self::w32(heap, frame + F_FINALLY_PC, as_pc(finally_pc));
        Self::w32(heap, frame + F_GOSUB, 0);
        Self::w32(heap, frame + F_NEXT, self.top);
        Self::set_word(heap, frame + F_THROWN, Value::NONE);
        heap.inc_ref(env);
        Self::set_word(heap, frame + F_ENV, env);
        self.top = frame;
        self.depth += 1;
        Ok(())
    }

    /// Route a thrown value (owned by the caller) to a handler of the
    /// activation `owner`, popping frames that cannot handle it.
    pub fn throw_value(&mut self, heap: &mut Heap, owner: usize, v: Value) -> Result<Resolution, FatalError> {
        loop {
            let frame = self.top;
            if frame == 0 || Self::r32(heap, frame + F_OWNER) as usize != owner {
                return Ok(Resolution::Unhandled(v));
            }
            let catch = Self::pc(heap, frame + F_CATCH_PC);
            let finally = Self::pc(heap, frame + F_FINALLY_PC);
            let (target, state) = match (Self::state_of(heap, frame), catch, finally) {
                (EhState::Idle, Some(pc), _) => (Some(pc), EhState::Raised),
                (EhState::Idle | EhState::InCatch, _, Some(pc)) => (Some(pc), EhState::InFinally),
                _ => (None, EhState::Idle),
            };
            match target {
                Some(pc) => {
                    Self::set_state(heap, frame, state);
                    let old = Self::word(heap, frame + F_THROWN);
                    Self::set_word(heap, frame + F_THROWN, v);
                    heap.dec_ref(old)?;
                    return Ok(Resolution::Handler {
                        pc,
                        stack_depth: Self::r32(heap, frame + F_STACK_DEPTH) as usize,
                        env: Self::word(heap, frame + F_ENV),
                    });
                }
                None => self.pop(heap)?,
            }
        }
    }

    /// `Catch`: hand the thrown value to the catch scope.
    pub fn enter_catch(&mut self, heap: &mut Heap, owner: usize) -> Result<Value, FatalError> {
        let frame = self.top_for(heap, owner)?;
        if Self::state_of(heap, frame) != EhState::Raised {
            return Err(FatalError::HandlerStack("catch entered without a raised exception"));
        }
        Self::set_state(heap, frame, EhState::InCatch);
        let v = Self::word(heap, frame + F_THROWN);
        Self::set_word(heap, frame + F_THROWN, Value::NONE);
        Ok(v)
    }

    /// `Finally`: entered either by `Gosub` or by a throw with a pending value.
    pub fn enter_finally(&mut self, heap: &mut Heap, owner: usize) -> Result<(), FatalError> {
        let frame = self.top_for(heap, owner)?;
        Self::set_state(heap, frame, EhState::InFinally);
        Ok(())
    }

    /// `Gosub`: remember where `Retsub` returns to.
    pub fn gosub(&mut self, heap: &mut Heap, owner: usize, return_pc: usize) -> Result<(), FatalError> {
        let frame = self.top_for(heap, owner)?;
        let node = heap.arena_mut().alloc_internal(NODE_SIZE)?;
        Self::w32(heap, node + N_RETURN_PC, return_pc as u32);
        Self::w32(heap, node + N_NEXT, Self::r32(heap, frame + F_GOSUB));
        Self::w32(heap, frame + F_GOSUB, node);
        Ok(())
    }

    /// `Retsub`: re-raise a pending exception, else return to the last gosub.
    pub fn retsub(&mut self, heap: &mut Heap, owner: usize) -> Result<RetsubAction, FatalError> {
        let frame = self.top_for(heap, owner)?;
        let pending = Self::word(heap, frame + F_THROWN);
        if !pending.is_none() {
            Self::set_word(heap, frame + F_THROWN, Value::NONE);
            self.pop(heap)?;
            return Ok(RetsubAction::Rethrow(pending));
        }
        let node = Self::r32(heap, frame + F_GOSUB);
        if node == 0 {
            return Err(FatalError::HandlerStack("retsub without a matching gosub"));
        }
        let pc = Self::r32(heap, node + N_RETURN_PC) as usize;
        Self::w32(heap, frame + F_GOSUB, Self::r32(heap, node + N_NEXT));
        heap.arena_mut().free_internal(node, NODE_SIZE)?;
        Ok(RetsubAction::Return(pc))
    }

    /// `EndTry`: pop the innermost frame.
    pub fn leave_try(&mut self, heap: &mut Heap, owner: usize) -> Result<(), FatalError> {
        self.top_for(heap, owner)?;
        self.pop(heap)
    }

    /// Pop every frame owned by activations at or above `owner`.
    pub fn unwind_owner(&mut self, heap: &mut Heap, owner: usize) -> Result<(), FatalError> {
        while self.top != 0 && Self::r32(heap, self.top + F_OWNER) as usize >= owner {
            self.pop(heap)?;
        }
        Ok(())
    }

    fn pop(&mut self, heap: &mut Heap) -> Result<(), FatalError> {
        let frame = self.top;
        if frame == 0 {
            return Err(FatalError::HandlerStack("pop of empty handler stack"));
        }
        let mut node = Self::r32(heap, frame + F_GOSUB);
        while node != 0 {
            let next = Self::r32(heap, node + N_NEXT);
            heap.arena_mut().free_internal(node, NODE_SIZE)?;
            node = next;
        }
        let thrown = Self::word(heap, frame + F_THROWN);
        let env = Self::word(heap, frame + F_ENV);
        self.top = Self::r32(heap, frame + F_NEXT);
        Self::w32(heap, frame + F_NEXT, self.free);
        self.free = frame;
        self.depth -= 1;
        heap.dec_ref(thrown)?;
        heap.dec_ref(env)
    }

    /// Every reference held by handler frames.
    pub fn roots(&self, heap: &Heap) -> Vec<Value> {
        let mut out = Vec::new();
        let mut frame = self.top;
        while frame != 0 {
            for at in [F_THROWN, F_ENV] {
                let v = Self::word(heap, frame + at);
                if v.needs_rc() {
                    out.push(v);
                }
            }
            frame = Self::r32(heap, frame + F_NEXT);
        }
        out
    }
}
