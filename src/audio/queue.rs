use rand::seq::SliceRandom;
use std::collections::VecDeque;
use tracing::debug;

use crate::sources::Track;

/// Modos de repetición del player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    None,
    Track,
    Queue,
}

impl std::str::FromStr for LoopMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(LoopMode::None),
            "track" => Ok(LoopMode::Track),
            "queue" => Ok(LoopMode::Queue),
            _ => Err(crate::error::Error::InvalidLoopMode(s.to_string())),
        }
    }
}

/// Cola FIFO de un guild.
///
/// `current` and `previous` live outside the pending list: `current` is the
/// track most recently dequeued and not yet superseded, `previous` is what
/// `current` was when the last track ended.
#[derive(Debug, Default, Clone)]
pub struct Queue {
    items: VecDeque<Track>,
    current: Option<Track>,
    previous: Option<Track>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Primer track pendiente.
    pub fn first(&self) -> Option<&Track> {
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    /// Agrega un track al final de la cola
    pub fn add(&mut self, track: Track) -> &mut Self {
        debug!("Queued: {}", track);
        self.items.push_back(track);
        self
    }

    pub fn add_many<I>(&mut self, tracks: I) -> usize
    where
        I: IntoIterator<Item = Track>,
    {
        let before = self.items.len();
        self.items.extend(tracks);
        self.items.len() - before
    }

    /// Puts a track back at the head, used by track looping.
    pub fn push_front(&mut self, track: Track) {
        self.items.push_front(track);
    }

    /// Elimina el track en `index`.
    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.items.remove(index)
    }

    /// Vacía la cola y devuelve lo que había pendiente.
    pub fn clear(&mut self) -> Vec<Track> {
        self.items.drain(..).collect()
    }

    /// Mezcla la cola
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.items.make_contiguous().shuffle(&mut rng);
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&Track> {
        self.previous.as_ref()
    }

    /// Moves the head of the queue into `current` and returns it.
    ///
    /// A track still sitting in `current` is being replaced and becomes
    /// `previous`.
    pub(crate) fn advance(&mut self) -> Option<&mut Track> {
        let next = self.items.pop_front()?;
        if let Some(replaced) = self.current.replace(next) {
            self.previous = Some(replaced);
        }
        self.current.as_mut()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut Track> {
        self.current.as_mut()
    }

    /// Retires `current` into `previous` and returns a copy of it.
    pub(crate) fn finish_current(&mut self) -> Option<Track> {
        let finished = self.current.take();
        self.previous = finished.clone();
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::tests::track;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_add_then_remove_returns_same_track() {
        let mut queue = Queue::new();
        let t = track("one");
        queue.add(t.clone());
        assert_eq!(queue.remove(0), Some(t));
        assert!(queue.is_empty());
        assert_eq!(queue.remove(0), None);
    }

    #[test]
    fn test_clear_returns_everything() {
        let mut queue = Queue::new();
        queue.add(track("a")).add(track("b")).add(track("c"));

        let drained = queue.clear();

        assert_eq!(
            drained.iter().map(|t| t.title().to_string()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_shuffle_keeps_every_track() {
        let mut queue = Queue::new();
        let titles: Vec<String> = (0..25).map(|i| format!("t{}", i)).collect();
        queue.add_many(titles.iter().map(|t| track(t)));

        queue.shuffle();

        let mut after: Vec<String> = queue.iter().map(|t| t.title().to_string()).collect();
        after.sort();
        let mut expected = titles.clone();
        expected.sort();
        assert_eq!(after, expected);
    }

    #[test]
    fn test_advance_and_finish_rotate_slots() {
        let mut queue = Queue::new();
        queue.add(track("a")).add(track("b"));

        assert_eq!(queue.advance().map(|t| t.title().to_string()), Some("a".into()));
        assert_eq!(queue.first().map(|t| t.title()), Some("b"));

        let finished = queue.finish_current();
        assert_eq!(finished.map(|t| t.title().to_string()), Some("a".into()));
        assert!(queue.current().is_none());
        assert_eq!(queue.previous().map(|t| t.title()), Some("a"));
    }

    #[test]
    fn test_advance_over_a_live_track_records_it() {
        let mut queue = Queue::new();
        queue.add(track("a")).add(track("b"));

        queue.advance();
        queue.advance();

        assert_eq!(queue.current().map(|t| t.title()), Some("b"));
        assert_eq!(queue.previous().map(|t| t.title()), Some("a"));
    }

    #[test]
    fn test_loop_mode_parsing() {
        assert_eq!("TRACK".parse::<LoopMode>().unwrap(), LoopMode::Track);
        assert_eq!("queue".parse::<LoopMode>().unwrap(), LoopMode::Queue);
        assert_eq!("none".parse::<LoopMode>().unwrap(), LoopMode::None);
        assert!("shuffle".parse::<LoopMode>().is_err());
    }
}
