use super::envelope::Envelope;
use super::pipe::Pipe;
use crate::error::IpcError;
use std::collections::VecDeque;

/// Envelopes waiting for room in one pipe.
///
/// Owned by a reactor thread that must never block on a full peer queue.
/// Envelopes leave in push order; once one waits, later ones wait behind it,
/// so a chunked payload is never interleaved with a newer one.
#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<Envelope>,
    queued_bytes: usize,
    limit: usize,
}

impl Outbox {
    /// `limit` bounds the payload bytes held back at any time.
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued_bytes: 0,
            limit,
        }
    }

    /// Send `chunks` now or queue what does not fit.
    ///
    /// Payload-carrying envelopes are refused as a whole when they would
    /// push the backlog past the limit; nothing is sent in that case.
    /// Envelopes without payload are always accepted.
    pub fn push(&mut self, pipe: &Pipe, chunks: Vec<Envelope>) -> Result<(), IpcError> {
        let bytes: usize = chunks.iter().map(|e| e.payload.len()).sum();
        if bytes > 0 && self.queued_bytes + bytes > self.limit {
            return Err(IpcError::Backlog {
                queued: self.queued_bytes,
                limit: self.limit,
            });
        }
        let mut chunks = chunks.into_iter();
        if self.queue.is_empty() {
            for env in chunks.by_ref() {
                if !pipe.try_send(&env)? {
                    self.enqueue(env);
                    break;
                }
            }
        }
        for env in chunks {
            self.enqueue(env);
        }
        Ok(())
    }

    /// Send queued envelopes until the pipe is full again. Returns how many left.
    pub fn flush(&mut self, pipe: &Pipe) -> Result<usize, IpcError> {
        while let Some(env) = self.queue.front() {
            let sent = match pipe.try_send(env) {
                Ok(sent) => sent,
                Err(e) => {
                    self.dequeue();
                    return Err(e);
                }
            };
            if !sent {
                break;
            }
            self.dequeue();
        }
        Ok(self.queue.len())
    }

    fn enqueue(&mut self, env: Envelope) {
        self.queued_bytes += env.payload.len();
        self.queue.push_back(env);
    }

    fn dequeue(&mut self) {
        if let Some(env) = self.queue.pop_front() {
            self.queued_bytes -= env.payload.len();
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Assembler, IPC_BUFFER_SIZE, Kind};
    use bytes::Bytes;
    use std::time::{Duration, Instant};

    fn fill(pipe: &Pipe) -> usize {
        let env = Envelope::new(Kind::PipeMessage, 0, vec![0u8; IPC_BUFFER_SIZE]);
        let mut sent = 0;
        while pipe.try_send(&env).unwrap() {
            sent += 1;
        }
        sent
    }

    #[test]
    fn test_full_pipe_queues_without_blocking() {
        let pipe = Pipe::new().unwrap();
        let prefill = fill(&pipe);
        let mut outbox = Outbox::new(1 << 20);

        let started = Instant::now();
        let data: Bytes = (0..IPC_BUFFER_SIZE * 3).map(|i| i as u8).collect();
        outbox
            .push(&pipe, Envelope::chunks(Kind::Receive, 7, data.clone()))
            .unwrap();
        outbox.push(&pipe, vec![Envelope::control(Kind::Close, 7)]).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outbox.len(), 4);
        assert_eq!(outbox.queued_bytes(), data.len());

        // Drain the reader side while flushing until everything went through.
        let mut asm = Assembler::default();
        let mut delivered = Vec::new();
        let mut skipped = 0;
        while delivered.len() < 2 {
            match pipe.try_recv().unwrap() {
                Some(env) if env.kind() == Kind::PipeMessage => skipped += 1,
                Some(env) => {
                    if let Some((header, payload)) = asm.push(env) {
                        delivered.push((header.kind, payload));
                    }
                }
                None => {}
            }
            outbox.flush(&pipe).unwrap();
        }
        assert_eq!(skipped, prefill);
        assert_eq!(delivered[0], (Kind::Receive, data));
        assert_eq!(delivered[1].0, Kind::Close);
        assert!(outbox.is_empty());
        assert_eq!(outbox.queued_bytes(), 0);
    }

    #[test]
    fn test_backlog_limit_refuses_whole_payload() {
        let pipe = Pipe::new().unwrap();
        fill(&pipe);
        let mut outbox = Outbox::new(IPC_BUFFER_SIZE * 2);
        let payload = |n: usize| Envelope::chunks(Kind::Receive, 1, vec![1u8; n].into());

        outbox.push(&pipe, payload(IPC_BUFFER_SIZE)).unwrap();
        let err = outbox.push(&pipe, payload(IPC_BUFFER_SIZE * 2)).unwrap_err();
        assert!(matches!(err, IpcError::Backlog { queued, .. } if queued == IPC_BUFFER_SIZE));
        assert_eq!(outbox.len(), 1);

        // Control envelopes still get through behind the backlog.
        outbox.push(&pipe, vec![Envelope::control(Kind::Close, 1)]).unwrap();
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_empty_outbox_sends_directly() {
        let pipe = Pipe::new().unwrap();
        let mut outbox = Outbox::new(16);
        outbox
            .push(&pipe, vec![Envelope::new(Kind::Receive, 3, Bytes::from_static(b"ping"))])
            .unwrap();
        assert!(outbox.is_empty());
        assert_eq!(pipe.try_recv().unwrap().unwrap().payload, Bytes::from_static(b"ping"));
        assert_eq!(outbox.flush(&pipe).unwrap(), 0);
    }
}
