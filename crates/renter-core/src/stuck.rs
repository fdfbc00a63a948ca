//! Files with recent successful stuck-chunk repairs

use std::collections::VecDeque;

use crate::types::FilePath;

/// Bounded LIFO of files
///
/// Pushing a file already present moves it to the top. Past capacity the
/// oldest file is forgotten.
#[derive(Debug)]
pub struct StuckStack {
    files: VecDeque<FilePath>,
    capacity: usize,
}

impl StuckStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            files: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, file: FilePath) {
        if self.capacity == 0 {
            return;
        }
        self.files.retain(|f| f != &file);
        if self.files.len() == self.capacity {
            self.files.pop_front();
        }
        self.files.push_back(file);
    }

    pub fn pop(&mut self) -> Option<FilePath> {
        self.files.pop_back()
    }

    pub fn contains(&self, file: &FilePath) -> bool {
        self.files.contains(file)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(name: &str) -> FilePath {
        FilePath::parse(name).unwrap()
    }

    #[test]
    fn test_lifo_with_move_to_top() {
        let mut stack = StuckStack::new(5);
        stack.push(f("a"));
        stack.push(f("b"));
        stack.push(f("a"));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop(), Some(f("a")));
        assert_eq!(stack.pop(), Some(f("b")));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_evicts_oldest() {
        let mut stack = StuckStack::new(2);
        stack.push(f("a"));
        stack.push(f("b"));
        stack.push(f("c"));
        assert!(!stack.contains(&f("a")));
        assert_eq!(stack.pop(), Some(f("c")));
        assert_eq!(stack.pop(), Some(f("b")));
    }
}
