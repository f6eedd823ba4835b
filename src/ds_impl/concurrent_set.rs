/// Keys stored in the sets.
pub type Key = i64;

/// Keys of the nodes. The sentinels sort below and above every user key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum NodeKey {
    NegInf,
    Fin(Key),
    PosInf,
}

impl NodeKey {
    #[inline]
    pub(crate) fn cmp_key(&self, key: Key) -> core::cmp::Ordering {
        match self {
            NodeKey::NegInf => core::cmp::Ordering::Less,
            NodeKey::Fin(k) => k.cmp(&key),
            NodeKey::PosInf => core::cmp::Ordering::Greater,
        }
    }
}

pub trait ConcurrentSet {
    type Handle<'domain>;

    fn new() -> Self;

    fn handle() -> Self::Handle<'static>;

    fn contains(&self, handle: &mut Self::Handle<'_>, key: Key) -> bool;

    /// Returns `false` if `key` is already present.
    fn insert(&self, handle: &mut Self::Handle<'_>, key: Key) -> bool;

    /// Returns `false` if `key` is absent, or if a concurrent remove of it won.
    fn remove(&self, handle: &mut Self::Handle<'_>, key: Key) -> bool;

    /// Number of keys. Exact only when no operation is in flight.
    fn size(&self) -> usize;
}
