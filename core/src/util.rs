use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;

/// Shared writer that serializes access so the transcript tee and mirrored
/// operator events interleave without tearing.
#[derive(Clone)]
pub struct LockedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LockedWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("tee writer poisoned"))?;
        guard.write_all(data)?;
        guard.flush()
    }

    pub fn write_str(&self, text: &str) -> std::io::Result<()> {
        self.write_all(text.as_bytes())
    }
}

impl std::fmt::Debug for LockedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn interleaves_whole_writes() {
        let buf = SharedBuf::default();
        let writer = LockedWriter::new(Box::new(buf.clone()));
        let clones: Vec<_> = (0..4).map(|_| writer.clone()).collect();
        let handles: Vec<_> = clones
            .into_iter()
            .enumerate()
            .map(|(i, w)| {
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        w.write_str(&format!("[{i}{i}{i}]")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let data = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(data).unwrap();
        for piece in text.split_inclusive(']') {
            let bytes = piece.as_bytes();
            assert_eq!(bytes[0], b'[');
            assert_eq!(bytes[1], bytes[2]);
            assert_eq!(bytes[2], bytes[3]);
        }
    }
}
