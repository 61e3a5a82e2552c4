/// Coalesces notification payloads into fixed-size frames.
#[derive(Debug)]
pub(crate) struct NotifyBuffer {
    items: Vec<u8>,
    capacity: usize,
}

impl NotifyBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Feeds a notification value, returning every frame it completed.
    /// Leftover bytes stay buffered for the next value.
    pub(crate) fn push(&mut self, mut value: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        while !value.is_empty() {
            let room = self.capacity - self.items.len();
            let (head, rest) = value.split_at(room.min(value.len()));
            self.items.extend_from_slice(head);
            value = rest;

            if self.items.len() >= self.capacity {
                frames.push(std::mem::replace(
                    &mut self.items,
                    Vec::with_capacity(self.capacity),
                ));
            }
        }

        frames
    }
}
