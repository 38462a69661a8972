/// Nested output capture for a single request.
///
/// The base buffer is always present and becomes the response body; every
/// `start` pushes a nested buffer on top of it.
#[derive(Debug, Default)]
pub struct OutputStack {
    base: Vec<u8>,
    nested: Vec<Vec<u8>>,
}

impl OutputStack {
    pub fn new() -> Self { Self::default() }

    pub fn write(&mut self, bytes: &[u8]) {
        self.top_mut().extend_from_slice(bytes);
    }

    pub fn start(&mut self) {
        self.nested.push(Vec::new());
    }

    /// Closes the innermost nested buffer and returns its contents.
    pub fn get_clean(&mut self) -> Option<Vec<u8>> {
        self.nested.pop()
    }

    /// Closes the innermost nested buffer, discarding it.
    pub fn end_clean(&mut self) -> bool {
        self.nested.pop().is_some()
    }

    pub fn level(&self) -> usize {
        self.nested.len()
    }

    /// Unwinds every buffer still open into its parent and returns the body.
    pub fn finish(mut self) -> Vec<u8> {
        while let Some(buffer) = self.nested.pop() {
            self.top_mut().extend_from_slice(&buffer);
        }
        self.base
    }

    fn top_mut(&mut self) -> &mut Vec<u8> {
        self.nested.last_mut().unwrap_or(&mut self.base)
    }
}
