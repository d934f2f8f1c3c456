use std::{collections::HashMap, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing a collection of wakers that are all waiting
/// on a single shared outcome. Unlike a queue of wakers, every waker in the
/// set is woken exactly once, when the set is consumed by `wake_all`.
///
/// Wakers are added to the set; when added, a token associated with the
/// Waker is returned. This token should be held by the waiting future and
/// can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the set when the future is dropped.
///
/// These tokens cannot be cloned or otherwise duplicated; this helps to
/// ensure that their lifespan is correctly associated with a particular
/// future.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,

    // Tokens are an ever-increasing integer. We assume that WakerSets are
    // relatively short-lived and that there's no chance of running out of
    // these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set. This token should be associated with the
    /// future, and when the future is re-polled, replace_waker should be
    /// used.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);

        self.wakers.insert(token.duplicate(), waker);
        token
    }

    /// Set a waker with an existing token in this set. The waker is passed by
    /// reference and is set with clone_from (or will_wake, if it's the same
    /// waker) because we assume that it comes from a Context and will need
    /// to be cloned anyway. An unknown token is re-inserted.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        match self.wakers.get_mut(token) {
            Some(existing) if existing.will_wake(waker) => {}
            Some(existing) => existing.clone_from(waker),
            None => {
                self.wakers.insert(token.duplicate(), waker.clone());
            }
        }
    }

    /// Discard a waker from this set without waking it. No-op if the token
    /// isn't present.
    pub(crate) fn discard_waker(&mut self, token: Token) {
        self.wakers.remove(&token);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }

    /// Consume the set, waking every waker in it.
    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
