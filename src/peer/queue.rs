use std::collections::VecDeque;

/// Кандидаты, пришедшие раньше, чем их можно применить/отправить.
/// Без ограничения размера и без дедупликации.
#[derive(Debug)]
pub struct CandidateQueue<T> {
    items: VecDeque<T>,
}

impl<T> CandidateQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Забирает всё в порядке поступления и оставляет очередь пустой
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T> Default for CandidateQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_fifo_order_and_empties() {
        let mut queue = CandidateQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.enqueue("a");
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.drain(), vec!["a", "b", "a"]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
