use std::collections::VecDeque;

use crate::SymbolId;

/// Generates the query words an equivalence oracle feeds to the teacher.
///
/// A strategy is exhausted when `next_word` returns `None`; `reset`
/// restarts it from scratch, which oracles do after every reported
/// counterexample so the next hypothesis is probed afresh.
pub trait SearchStrategy {
    fn next_word(&mut self) -> Option<Vec<SymbolId>>;
    fn reset(&mut self);
}

/// Breadth-first enumeration of all words up to a depth bound.
#[derive(Debug)]
pub struct BreadthFirst {
    alphabet: Vec<SymbolId>,
    max_depth: usize,
    queue: VecDeque<Vec<SymbolId>>,
}

impl BreadthFirst {
    pub fn new(alphabet: Vec<SymbolId>, max_depth: usize) -> Self {
        let mut this = Self {
            alphabet,
            max_depth,
            queue: VecDeque::new(),
        };
        this.reset();
        this
    }
}

impl SearchStrategy for BreadthFirst {
    fn next_word(&mut self) -> Option<Vec<SymbolId>> {
        let word = self.queue.pop_front()?;
        if word.len() < self.max_depth {
            for &symbol in &self.alphabet {
                let mut extended = word.clone();
                extended.push(symbol);
                self.queue.push_back(extended);
            }
        }
        Some(word)
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.queue.push_back(Vec::new());
    }
}

/// Random sampling of words in the spirit of the W-method: uniformly drawn
/// lengths up to a depth bound, uniformly drawn symbols, a fixed sample
/// budget per hypothesis. Seeded, so runs are reproducible.
#[derive(Debug)]
pub struct RandomWMethod {
    alphabet: Vec<SymbolId>,
    max_depth: usize,
    max_samples: usize,
    seed: u64,
    rng: fastrand::Rng,
    drawn: usize,
}

impl RandomWMethod {
    pub fn new(alphabet: Vec<SymbolId>, max_depth: usize, max_samples: usize, seed: u64) -> Self {
        Self {
            alphabet,
            max_depth: max_depth.max(1),
            max_samples,
            seed,
            rng: fastrand::Rng::with_seed(seed),
            drawn: 0,
        }
    }
}

impl SearchStrategy for RandomWMethod {
    fn next_word(&mut self) -> Option<Vec<SymbolId>> {
        if self.drawn >= self.max_samples || self.alphabet.is_empty() {
            return None;
        }
        self.drawn += 1;
        let len = self.rng.usize(1..=self.max_depth);
        Some(
            (0..len)
                .map(|_| self.alphabet[self.rng.usize(0..self.alphabet.len())])
                .collect(),
        )
    }

    fn reset(&mut self) {
        self.rng = fastrand::Rng::with_seed(self.seed);
        self.drawn = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breadth_first_enumerates_shortest_first() {
        let mut strategy = BreadthFirst::new(vec![0, 1], 2);
        assert_eq!(strategy.next_word(), Some(vec![]));
        assert_eq!(strategy.next_word(), Some(vec![0]));
        assert_eq!(strategy.next_word(), Some(vec![1]));
        assert_eq!(strategy.next_word(), Some(vec![0, 0]));
        // depth bound: words of length 2 are not extended further
        let rest: Vec<_> = std::iter::from_fn(|| strategy.next_word()).collect();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|w| w.len() == 2));

        strategy.reset();
        assert_eq!(strategy.next_word(), Some(vec![]));
    }

    #[test]
    fn random_sampler_is_reproducible_and_bounded() {
        let mut a = RandomWMethod::new(vec![0, 1, 2], 5, 10, 42);
        let mut b = RandomWMethod::new(vec![0, 1, 2], 5, 10, 42);
        let words_a: Vec<_> = std::iter::from_fn(|| a.next_word()).collect();
        let words_b: Vec<_> = std::iter::from_fn(|| b.next_word()).collect();
        assert_eq!(words_a, words_b);
        assert_eq!(words_a.len(), 10);
        assert!(words_a.iter().all(|w| (1..=5).contains(&w.len())));

        a.reset();
        let again: Vec<_> = std::iter::from_fn(|| a.next_word()).collect();
        assert_eq!(words_a, again);
    }
}
