use rand::seq::SliceRandom;

/// Supplies the passage typed in a race. One call per started race.
pub trait TextProvider: Send + Sync {
    fn next_passage(&self) -> String;
}

const DEFAULT_PASSAGES: &[&str] = &[
    "The quick brown fox jumps over the lazy dog while the farmer counts his sheep twice.",
    "Typing races reward steady rhythm over bursts of speed, so keep your eyes on the next word.",
    "A lighthouse keeper wrote letters every evening and sealed each one with blue wax.",
    "Packets crossed the ocean in a fraction of a second, carrying every keystroke to the server.",
    "Practice makes progress: short daily sessions beat a single long one at the end of the week.",
];

/// Picks passages uniformly at random from a fixed pool.
#[derive(Debug, Clone)]
pub struct RandomTextPool {
    passages: Vec<String>,
}

impl RandomTextPool {
    /// Falls back to the built-in passages when `passages` is empty.
    pub fn new(passages: Vec<String>) -> Self {
        if passages.is_empty() {
            return Self::default();
        }
        Self { passages }
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

impl Default for RandomTextPool {
    fn default() -> Self {
        Self {
            passages: DEFAULT_PASSAGES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TextProvider for RandomTextPool {
    fn next_passage(&self) -> String {
        self.passages
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }
}
