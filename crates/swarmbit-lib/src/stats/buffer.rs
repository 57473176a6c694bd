use std::ops::Deref;

/// Keeps the last `size` pushed items
pub struct CircularBuffer<T> {
    pos: usize,
    size: usize,
    inner: Vec<T>,
}

impl<T> CircularBuffer<T> {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        CircularBuffer {
            pos: 0,
            size,
            inner: Vec::with_capacity(size),
        }
    }

    pub fn push_back(&mut self, item: T) {
        if self.inner.len() < self.size {
            self.inner.push(item);
        } else {
            self.inner[self.pos] = item;
        }

        self.pos = (self.pos + 1) % self.size;
    }
}

impl<T> Deref for CircularBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrites_oldest_items() {
        let mut buffer = CircularBuffer::new(3);
        for item in 1..=5 {
            buffer.push_back(item);
        }

        let mut items = buffer.to_vec();
        items.sort();
        assert_eq!(items, vec![3, 4, 5]);
    }
}
