//! Atomically replaceable handle to a store's current generation.

use crate::generation::Generation;
use arc_swap::ArcSwap;
use std::sync::Arc;

pub struct SwitchableGeneration {
    current: ArcSwap<Generation>,
}

impl SwitchableGeneration {
    pub fn new(initial: Arc<Generation>) -> Self {
        Self {
            current: ArcSwap::new(initial),
        }
    }

    /// The current generation. Callers resolve this once per logical
    /// operation and must not hold on to it across operations.
    pub fn get(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    /// Installs `new` and returns the generation it replaced.
    pub fn set(&self, new: Arc<Generation>) -> Arc<Generation> {
        self.current.swap(new)
    }

    /// Installs `new` only if `expected` is still current. Returns whether the
    /// swap happened.
    pub fn change(&self, expected: &Arc<Generation>, new: Arc<Generation>) -> bool {
        let previous = self.current.compare_and_swap(expected, new);
        Arc::ptr_eq(&*previous, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationId;
    use crate::params::StoreParams;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn generation(n: u32) -> Arc<Generation> {
        Generation::memory(GenerationId::new(n), StoreParams::with_indexes(["SPOG"])).unwrap()
    }

    #[test]
    fn set_returns_previous() {
        let first = generation(1);
        let container = SwitchableGeneration::new(first.clone());
        let second = generation(2);
        let previous = container.set(second.clone());
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&container.get(), &second));
    }

    #[test]
    fn change_checks_expected() {
        let first = generation(1);
        let container = SwitchableGeneration::new(first.clone());
        let second = generation(2);
        assert!(!container.change(&second, generation(3)));
        assert_eq!(container.get().id(), GenerationId::new(1));
        assert!(container.change(&first, second));
        assert_eq!(container.get().id(), GenerationId::new(2));
    }

    #[test]
    fn concurrent_gets_see_whole_generations() {
        let first = generation(1);
        let second = generation(2);
        let container = Arc::new(SwitchableGeneration::new(first.clone()));
        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let container = container.clone();
                let stop = stop.clone();
                let (first, second) = (first.clone(), second.clone());
                std::thread::spawn(move || {
                    let mut seen = 0usize;
                    loop {
                        let g = container.get();
                        assert!(Arc::ptr_eq(&g, &first) || Arc::ptr_eq(&g, &second));
                        // id and coordinator always belong to the same generation
                        assert_eq!(g.id(), g.coordinator().generation());
                        seen += 1;
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    seen
                })
            })
            .collect();
        for i in 0..1000 {
            let next = if i % 2 == 0 { second.clone() } else { first.clone() };
            container.set(next);
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            assert!(r.join().unwrap() > 0);
        }
    }
}
