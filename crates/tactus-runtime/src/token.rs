//! Reference-counted payload tokens.
//!
//! Tokens carry reaction payloads between events and ports without
//! copying: fan-out to several destinations just bumps a reference
//! count. Zeroed tokens return to a recycling free list so steady-state
//! execution allocates nothing. All refcount traffic happens under the
//! runtime's critical section; the pool itself is not a lock.

use std::sync::Arc;

use tracing::error;

/// Runs over the payload bytes when the last reference is released.
pub type Destructor = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// Produces the bytes of a copy when a mutable input needs its own
/// payload. Defaults to a plain byte copy when absent.
pub type CopyConstructor = Arc<dyn Fn(&[u8]) -> Box<[u8]> + Send + Sync>;

/// What the pool is allowed to release when a token's refcount hits zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OkToFree {
    /// Release nothing the user cares about: the destructor is skipped.
    No,
    /// Run the destructor over the value; the token slot is recycled.
    ValueOnly,
    /// Run the destructor and recycle both value and token.
    #[default]
    TokenAndValue,
}

/// Handle to a token slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(pub(crate) u32);

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// A reference-counted payload carrier.
#[derive(Default)]
pub struct Token {
    /// Payload bytes, `length * element_size` of them. `None` for a
    /// payload-free token.
    value: Option<Box<[u8]>>,
    /// Element count (1 for a scalar, N for an array, 0 for no payload).
    length: usize,
    /// Size of one element in bytes.
    element_size: usize,
    /// Live holders: queued events + present ports/actions.
    ref_count: u32,
    ok_to_free: OkToFree,
    destructor: Option<Destructor>,
    copy_constructor: Option<CopyConstructor>,
}

impl Token {
    /// Payload bytes, if any.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Element count carried by this token.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Declared element size in bytes.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Current number of live holders.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// Recycling pool of token slots, indexed by [`TokenId`].
///
/// Lives inside the scheduler state, so every operation is already
/// serialized by the runtime's critical section.
#[derive(Default)]
pub struct TokenPool {
    slots: Vec<Token>,
    free: Vec<TokenId>,
    created: u64,
}

impl TokenPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token with no payload and a refcount of zero.
    ///
    /// Recycles a free slot when one exists.
    pub fn create_token(&mut self, element_size: usize) -> TokenId {
        self.created += 1;
        match self.free.pop() {
            Some(id) => {
                let slot = &mut self.slots[id.0 as usize];
                *slot = Token {
                    element_size,
                    ..Token::default()
                };
                id
            }
            None => {
                let id = TokenId(self.slots.len() as u32);
                self.slots.push(Token {
                    element_size,
                    ..Token::default()
                });
                id
            }
        }
    }

    /// Install payload bytes on a token.
    ///
    /// Reuses the slot when the token has at most one holder; otherwise
    /// the payload lands on a fresh token so existing holders keep
    /// seeing the old bytes. Returns the token actually carrying the
    /// payload.
    pub fn initialize_with_value(
        &mut self,
        token: TokenId,
        value: Box<[u8]>,
        length: usize,
    ) -> TokenId {
        let element_size = self.slots[token.0 as usize].element_size;
        let target = if self.slots[token.0 as usize].ref_count <= 1 {
            token
        } else {
            self.create_token(element_size)
        };
        let slot = &mut self.slots[target.0 as usize];
        slot.value = Some(value);
        slot.length = length;
        slot.ok_to_free = OkToFree::TokenAndValue;
        target
    }

    /// Set the release policy for a token.
    pub fn set_ok_to_free(&mut self, token: TokenId, policy: OkToFree) {
        self.slots[token.0 as usize].ok_to_free = policy;
    }

    /// Install a user destructor, run over the payload on release.
    pub fn set_destructor(&mut self, token: TokenId, destructor: Option<Destructor>) {
        self.slots[token.0 as usize].destructor = destructor;
    }

    /// Install a user copy constructor.
    pub fn set_copy_constructor(&mut self, token: TokenId, ctor: Option<CopyConstructor>) {
        self.slots[token.0 as usize].copy_constructor = ctor;
    }

    /// Read-only access to a token slot.
    pub fn get(&self, token: TokenId) -> &Token {
        &self.slots[token.0 as usize]
    }

    /// Clone the payload bytes, honoring the copy constructor if set.
    pub fn copy_value(&self, token: TokenId) -> Option<Box<[u8]>> {
        let slot = &self.slots[token.0 as usize];
        let bytes = slot.value.as_deref()?;
        Some(match &slot.copy_constructor {
            Some(ctor) => ctor(bytes),
            None => bytes.into(),
        })
    }

    /// Add a live holder.
    pub fn inc_ref(&mut self, token: TokenId) {
        self.inc_ref_by(token, 1);
    }

    /// Add `n` live holders at once (port fan-out).
    pub fn inc_ref_by(&mut self, token: TokenId, n: u32) {
        self.slots[token.0 as usize].ref_count += n;
    }

    /// Drop a live holder; releases and recycles the slot at zero.
    ///
    /// Underflow means the holder accounting is broken and determinism
    /// is already lost, so it is fatal.
    pub fn dec_ref(&mut self, token: TokenId) {
        let slot = &mut self.slots[token.0 as usize];
        if slot.ref_count == 0 {
            error!(%token, "token reference count underflow");
            panic!("token reference count underflow on {token}");
        }
        slot.ref_count -= 1;
        if slot.ref_count == 0 {
            self.release(token);
        }
    }

    /// Number of tokens currently outside the free list with a nonzero
    /// refcount or payload. Zero after a clean run.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.ref_count > 0 || s.value.is_some())
            .count()
    }

    /// Total tokens handed out over the pool's lifetime.
    pub fn created(&self) -> u64 {
        self.created
    }

    fn release(&mut self, token: TokenId) {
        let slot = &mut self.slots[token.0 as usize];
        if let Some(mut value) = slot.value.take() {
            // OkToFree::No suppresses the user destructor; the buffer
            // itself is owned by the pool and always dropped.
            if !matches!(slot.ok_to_free, OkToFree::No) {
                if let Some(destructor) = slot.destructor.take() {
                    destructor(&mut value);
                }
            }
        }
        *slot = Token::default();
        self.free.push(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn create_and_release_recycles_slot() {
        let mut pool = TokenPool::new();
        let a = pool.create_token(8);
        pool.inc_ref(a);
        pool.dec_ref(a);
        assert_eq!(pool.live(), 0);

        // The freed slot is reused.
        let b = pool.create_token(4);
        assert_eq!(a, b);
        assert_eq!(pool.get(b).element_size(), 4);
    }

    #[test]
    fn initialize_reuses_single_holder_token() {
        let mut pool = TokenPool::new();
        let t = pool.create_token(1);
        pool.inc_ref(t);
        let out = pool.initialize_with_value(t, vec![1, 2, 3].into(), 3);
        assert_eq!(out, t);
        assert_eq!(pool.get(out).value(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn initialize_forks_shared_token() {
        let mut pool = TokenPool::new();
        let t = pool.create_token(1);
        pool.inc_ref_by(t, 2);
        let out = pool.initialize_with_value(t, vec![9].into(), 1);
        assert_ne!(out, t);
        assert_eq!(pool.get(out).value(), Some(&[9u8][..]));
        assert_eq!(pool.get(t).value(), None);
    }

    #[test]
    fn destructor_runs_once_on_last_release() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let mut pool = TokenPool::new();
        let t = pool.create_token(1);
        let t = pool.initialize_with_value(t, vec![7].into(), 1);
        pool.set_destructor(t, Some(Arc::new(|_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        })));
        pool.inc_ref_by(t, 3);
        pool.dec_ref(t);
        pool.dec_ref(t);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        pool.dec_ref(t);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn ok_to_free_no_skips_destructor() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let mut pool = TokenPool::new();
        let t = pool.create_token(1);
        let t = pool.initialize_with_value(t, vec![7].into(), 1);
        pool.set_ok_to_free(t, OkToFree::No);
        pool.set_destructor(t, Some(Arc::new(|_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        })));
        pool.inc_ref(t);
        pool.dec_ref(t);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn copy_value_uses_copy_constructor() {
        let mut pool = TokenPool::new();
        let t = pool.create_token(1);
        let t = pool.initialize_with_value(t, vec![1, 1].into(), 2);
        pool.set_copy_constructor(t, Some(Arc::new(|b| {
            b.iter().map(|x| x + 1).collect()
        })));
        assert_eq!(pool.copy_value(t).unwrap().as_ref(), &[2, 2]);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn dec_below_zero_panics() {
        let mut pool = TokenPool::new();
        let t = pool.create_token(1);
        pool.dec_ref(t);
    }
}
