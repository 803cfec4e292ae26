//! Hot-standby rotation: one `current` worker, at most one `candidate`.
//! Only the owner of the `Rotation` swaps `current`, so two workers are never
//! both current.

pub struct Rotation<W> {
    current: Option<W>,
    candidate: Option<(u64, W)>,
    generation: u64,
}

impl<W> Default for Rotation<W> {
    fn default() -> Self {
        Self {
            current: None,
            candidate: None,
            generation: 0,
        }
    }
}

impl<W> Rotation<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&W> {
        self.current.as_ref()
    }

    pub fn candidate(&self) -> Option<&W> {
        self.candidate.as_ref().map(|(_, w)| w)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next generation number, to derive the candidate's id before it starts.
    pub fn next_generation(&self) -> u64 {
        self.generation + 1
    }

    /// Install a candidate. Returns any earlier candidate that never got promoted.
    pub fn begin(&mut self, worker: W) -> (u64, Option<W>) {
        self.generation += 1;
        let stale = self.candidate.replace((self.generation, worker)).map(|(_, w)| w);
        (self.generation, stale)
    }

    /// Swap the candidate of `generation` in. Returns the deposed worker for teardown.
    pub fn promote(&mut self, generation: u64) -> Result<Option<W>, RotationError> {
        match &self.candidate {
            Some((g, _)) if *g == generation => {}
            Some((g, _)) => {
                return Err(RotationError::Stale {
                    requested: generation,
                    live: *g,
                })
            }
            None => return Err(RotationError::NoCandidate),
        }
        let (_, worker) = self.candidate.take().ok_or(RotationError::NoCandidate)?;
        Ok(self.current.replace(worker))
    }

    /// Promote only when `accept(current, candidate)` holds; otherwise drop the candidate.
    /// Returns the worker to tear down: the deposed current on success, the candidate on refusal.
    pub fn promote_if(
        &mut self,
        generation: u64,
        accept: impl FnOnce(Option<&W>, &W) -> bool,
    ) -> Result<Swap<W>, RotationError> {
        let candidate = match &self.candidate {
            Some((g, w)) if *g == generation => w,
            Some((g, _)) => {
                return Err(RotationError::Stale {
                    requested: generation,
                    live: *g,
                })
            }
            None => return Err(RotationError::NoCandidate),
        };
        if accept(self.current.as_ref(), candidate) {
            Ok(Swap::Promoted(self.promote(generation)?))
        } else {
            Ok(Swap::Refused(self.abandon(generation)))
        }
    }

    /// Drop the candidate of `generation` (it failed to start or was refused).
    pub fn abandon(&mut self, generation: u64) -> Option<W> {
        match &self.candidate {
            Some((g, _)) if *g == generation => self.candidate.take().map(|(_, w)| w),
            _ => None,
        }
    }

    /// Take everything out, for shutdown.
    pub fn drain(&mut self) -> Vec<W> {
        self.current
            .take()
            .into_iter()
            .chain(self.candidate.take().map(|(_, w)| w))
            .collect()
    }
}

pub enum Swap<W> {
    /// Candidate is current now; holds the deposed worker, if any.
    Promoted(Option<W>),
    /// Candidate was dropped.
    Refused(Option<W>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RotationError {
    #[error("no candidate to promote")]
    NoCandidate,
    #[error("candidate generation {requested} was superseded by {live}")]
    Stale { requested: u64, live: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_returns_deposed_worker() {
        let mut r = Rotation::new();
        let (g1, _) = r.begin("w1");
        assert_eq!(r.promote(g1), Ok(None));
        let (g2, _) = r.begin("w2");
        assert_eq!(r.current(), Some(&"w1"));
        assert_eq!(r.promote(g2), Ok(Some("w1")));
        assert_eq!(r.current(), Some(&"w2"));
        assert!(r.candidate().is_none());
    }

    #[test]
    fn superseded_candidate_cannot_promote() {
        let mut r = Rotation::new();
        let (g1, _) = r.begin("w1");
        let (g2, stale) = r.begin("w2");
        assert_eq!(stale, Some("w1"));
        assert_eq!(r.promote(g1), Err(RotationError::Stale { requested: g1, live: g2 }));
        assert_eq!(r.promote(g2), Ok(None));
    }

    #[test]
    fn refused_candidate_is_returned() {
        let mut r = Rotation::new();
        let (g1, _) = r.begin(10);
        r.promote(g1).unwrap();
        let (g2, _) = r.begin(3);
        match r.promote_if(g2, |cur, cand| cand > cur.unwrap()).unwrap() {
            Swap::Refused(w) => assert_eq!(w, Some(3)),
            Swap::Promoted(_) => panic!("smaller candidate must not win"),
        }
        assert_eq!(r.current(), Some(&10));
        assert_eq!(r.next_generation(), g2 + 1);
    }
}
