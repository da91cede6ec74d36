//! Pipe protocol between a mirror and a target process
//!
//! Every request is a two-byte code, optionally followed by a fixed-size
//! payload; every response is exactly as long as the request implies. Words
//! on the wire are 8-byte little-endian regardless of the target.
//!
//! | request | payload            | response                               |
//! |---------|--------------------|----------------------------------------|
//! | `k\n`   |                    | instance kind, 1 byte                  |
//! | `i\n`   |                    | instance address                       |
//! | `r\n`   |                    | image count, then 6 (start, size) each |
//! | `b\n`   | address, size      | `size` bytes                           |
//! | `s\n`   | name, `\n`         | symbol address or 0                    |
//! | `l\n`   | address            | string length                          |
//! | `d\n`   |                    | none; the responder exits              |

use crate::error::{MirrorError, MirrorResult};
use crate::reader::MemoryReader;
use crate::registry::{ReflectionInfo, RemoteSection};
use keystone_abi::TargetAbi;
use keystone_runtime::Runtime;
use parking_lot::Mutex;
use std::io::{self, BufRead, Read, Write};
use tracing::{debug, trace, warn};

pub const READ_BYTES: [u8; 2] = *b"b\n";
pub const SYMBOL_ADDRESS: [u8; 2] = *b"s\n";
pub const STRING_LENGTH: [u8; 2] = *b"l\n";
pub const INSTANCE_KIND: [u8; 2] = *b"k\n";
pub const INSTANCE_ADDRESS: [u8; 2] = *b"i\n";
pub const REFLECTION_INFO: [u8; 2] = *b"r\n";
pub const DONE: [u8; 2] = *b"d\n";

/// Largest single read either side will move over the pipe
pub const MAX_READ: u64 = 1 << 24;

/// Largest image count a reflection info response may announce
const MAX_IMAGES: u64 = 1 << 12;

/// What the target offers for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstanceKind {
    None = 0,
    /// A heap object; the address is the object
    Object = 1,
    /// An existential container; the address is the container
    Existential = 2,
}

impl InstanceKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(InstanceKind::None),
            1 => Some(InstanceKind::Object),
            2 => Some(InstanceKind::Existential),
            _ => None,
        }
    }
}

fn write_word(out: &mut impl Write, value: u64) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn read_word(input: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

struct Streams<R, W> {
    input: R,
    output: W,
}

impl<R: Read, W: Write> Streams<R, W> {
    fn request(&mut self, code: [u8; 2], payload: &[u8]) -> io::Result<()> {
        self.output.write_all(&code)?;
        self.output.write_all(payload)?;
        self.output.flush()
    }

    fn word_request(&mut self, code: [u8; 2], payload: &[u8]) -> io::Result<u64> {
        self.request(code, payload)?;
        read_word(&mut self.input)
    }
}

/// Mirror-side client of the pipe protocol
///
/// One request is in flight at a time; concurrent callers queue on the lock.
pub struct PipeMemoryReader<R, W> {
    streams: Mutex<Streams<R, W>>,
    pointer_size: u8,
}

impl<R: Read, W: Write> PipeMemoryReader<R, W> {
    /// Client for a target with the host's pointer width
    pub fn new(input: R, output: W) -> Self {
        Self {
            streams: Mutex::new(Streams { input, output }),
            pointer_size: TargetAbi::host().pointer_size,
        }
    }

    pub fn instance_kind(&self) -> MirrorResult<InstanceKind> {
        let mut streams = self.streams.lock();
        streams.request(INSTANCE_KIND, &[])?;
        let mut byte = [0u8; 1];
        streams.input.read_exact(&mut byte)?;
        InstanceKind::from_u8(byte[0])
            .ok_or_else(|| MirrorError::Protocol(format!("instance kind {}", byte[0])))
    }

    pub fn instance_address(&self) -> MirrorResult<u64> {
        Ok(self.streams.lock().word_request(INSTANCE_ADDRESS, &[])?)
    }

    /// Reflection sections of every image loaded in the target
    pub fn reflection_infos(&self) -> MirrorResult<Vec<ReflectionInfo>> {
        let mut streams = self.streams.lock();
        let count = streams.word_request(REFLECTION_INFO, &[])?;
        if count > MAX_IMAGES {
            return Err(MirrorError::Protocol(format!("{} images", count)));
        }
        let mut infos = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut sections = [RemoteSection::default(); 6];
            for section in sections.iter_mut() {
                section.start = read_word(&mut streams.input)?;
                section.size = read_word(&mut streams.input)?;
            }
            infos.push(ReflectionInfo { sections });
        }
        debug!(images = infos.len(), "received reflection info");
        Ok(infos)
    }

    /// Tell the responder to exit
    pub fn done(&self) -> MirrorResult<()> {
        Ok(self.streams.lock().request(DONE, &[])?)
    }
}

impl<R: Read, W: Write> MemoryReader for PipeMemoryReader<R, W> {
    fn pointer_size(&self) -> u8 {
        self.pointer_size
    }

    fn size_size(&self) -> u8 {
        self.pointer_size
    }

    fn read_bytes(&self, address: u64, size: u64) -> MirrorResult<Vec<u8>> {
        if size > MAX_READ {
            return Err(MirrorError::ReadFailed { address, size });
        }
        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&address.to_le_bytes());
        payload[8..].copy_from_slice(&size.to_le_bytes());
        let mut streams = self.streams.lock();
        streams.request(READ_BYTES, &payload)?;
        let mut buffer = vec![0u8; size as usize];
        streams.input.read_exact(&mut buffer)?;
        trace!(address, size, "remote read");
        Ok(buffer)
    }

    fn string_length(&self, address: u64) -> MirrorResult<u64> {
        let length = self
            .streams
            .lock()
            .word_request(STRING_LENGTH, &address.to_le_bytes())?;
        if length > MAX_READ {
            return Err(MirrorError::ReadFailed { address, size: length });
        }
        Ok(length)
    }

    fn symbol_address(&self, name: &str) -> MirrorResult<u64> {
        if name.contains('\n') {
            return Err(MirrorError::MissingSymbol(name.to_string()));
        }
        let mut payload = name.as_bytes().to_vec();
        payload.push(b'\n');
        match self.streams.lock().word_request(SYMBOL_ADDRESS, &payload)? {
            0 => Err(MirrorError::MissingSymbol(name.to_string())),
            address => Ok(address),
        }
    }
}

/// Target-side server answering requests from a runtime's address space
pub struct Responder<'a, R, W> {
    runtime: &'a Runtime,
    input: R,
    output: W,
    kind: InstanceKind,
    address: u64,
}

impl<'a, R: BufRead, W: Write> Responder<'a, R, W> {
    pub fn new(runtime: &'a Runtime, input: R, output: W) -> Self {
        Self {
            runtime,
            input,
            output,
            kind: InstanceKind::None,
            address: 0,
        }
    }

    /// Offer a value for inspection
    pub fn with_instance(mut self, kind: InstanceKind, address: u64) -> Self {
        self.kind = kind;
        self.address = address;
        self
    }

    /// Answer requests until `d\n` or the peer closes its end
    ///
    /// Returns the number of requests served. Reads of unmapped memory are
    /// answered with zeros so every response keeps its promised length.
    pub fn serve(&mut self) -> MirrorResult<u64> {
        let mut served = 0u64;
        loop {
            let mut code = [0u8; 2];
            match self.input.read_exact(&mut code) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(served, "peer closed the pipe");
                    return Ok(served);
                }
                Err(e) => return Err(e.into()),
            }
            if code == DONE {
                debug!(served, "done");
                return Ok(served);
            }
            self.answer(code)?;
            self.output.flush()?;
            served += 1;
        }
    }

    fn answer(&mut self, code: [u8; 2]) -> MirrorResult<()> {
        match code {
            INSTANCE_KIND => self.output.write_all(&[self.kind as u8])?,
            INSTANCE_ADDRESS => write_word(&mut self.output, self.address)?,
            REFLECTION_INFO => {
                let images = self.runtime.images();
                write_word(&mut self.output, images.len() as u64)?;
                for image in &images {
                    for range in image.reflection_sections() {
                        write_word(&mut self.output, range.start)?;
                        write_word(&mut self.output, range.size)?;
                    }
                }
            }
            READ_BYTES => {
                let address = read_word(&mut self.input)?;
                let size = read_word(&mut self.input)?;
                if size > MAX_READ {
                    return Err(MirrorError::Protocol(format!("read of {} bytes", size)));
                }
                let bytes = match self.runtime.memory().read_bytes(address, size) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(address, size, error = %e, "unmapped read; answering zeros");
                        vec![0u8; size as usize]
                    }
                };
                self.output.write_all(&bytes)?;
            }
            SYMBOL_ADDRESS => {
                let mut name = Vec::new();
                self.input.read_until(b'\n', &mut name)?;
                if name.pop() != Some(b'\n') {
                    return Err(MirrorError::Protocol("unterminated symbol name".to_string()));
                }
                let name = String::from_utf8_lossy(&name);
                let address = self.runtime.symbol(&name).unwrap_or(0);
                trace!(symbol = %name, address, "symbol lookup");
                write_word(&mut self.output, address)?;
            }
            STRING_LENGTH => {
                let address = read_word(&mut self.input)?;
                let length = match self.runtime.memory().read_cstr(address) {
                    Ok(text) => text.len() as u64,
                    Err(e) => {
                        warn!(address, error = %e, "unreadable string");
                        0
                    }
                };
                write_word(&mut self.output, length)?;
            }
            other => return Err(MirrorError::UnknownRequest(other)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn test_requests_over_os_pipes() {
        let rt = Runtime::new().unwrap();
        let int64 = rt.symbol("$sBi64_N").unwrap();
        let container = rt.make_existential(int64, &42u64.to_le_bytes(), &[]).unwrap();
        let (to_target_rx, to_target_tx) = io::pipe().unwrap();
        let (to_mirror_rx, to_mirror_tx) = io::pipe().unwrap();

        std::thread::scope(|scope| {
            let server = scope.spawn(|| {
                Responder::new(&rt, BufReader::new(to_target_rx), to_mirror_tx)
                    .with_instance(InstanceKind::Existential, container)
                    .serve()
            });

            let client = PipeMemoryReader::new(to_mirror_rx, to_target_tx);
            assert_eq!(client.instance_kind().unwrap(), InstanceKind::Existential);
            assert_eq!(client.instance_address().unwrap(), container);
            assert_eq!(client.read_word(container).unwrap(), 42);
            assert_eq!(client.symbol_address("$sBi64_N").unwrap(), int64);
            assert!(matches!(
                client.symbol_address("$sNotThere"),
                Err(MirrorError::MissingSymbol(_))
            ));
            assert_eq!(client.read_bytes(16, 4).unwrap(), vec![0; 4]);
            assert!(client.reflection_infos().unwrap().is_empty());
            client.done().unwrap();
            assert_eq!(server.join().unwrap().unwrap(), 7);
        });
    }

    #[test]
    fn test_unknown_request_stops_the_responder() {
        let rt = Runtime::new().unwrap();
        let mut out = Vec::new();
        let mut responder = Responder::new(&rt, &b"zz"[..], &mut out);
        assert!(matches!(
            responder.serve(),
            Err(MirrorError::UnknownRequest([b'z', b'z']))
        ));
    }

    #[test]
    fn test_eof_ends_the_session() {
        let rt = Runtime::new().unwrap();
        let mut out = Vec::new();
        let served = Responder::new(&rt, &b"k\ni\n"[..], &mut out)
            .with_instance(InstanceKind::Object, 0x1000)
            .serve()
            .unwrap();
        assert_eq!(served, 2);
        assert_eq!(out[0], InstanceKind::Object as u8);
        assert_eq!(&out[1..9], &0x1000u64.to_le_bytes());
    }
}
