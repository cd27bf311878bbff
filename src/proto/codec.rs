//! The frame codec: encode/decode typed frames on a byte stream.
//!
//! Framing is length-delimited per field; there is no outer frame length.
//! A decode error therefore desynchronises the stream, and the only correct
//! recovery is to tear down the connection — [`FrameCodec::decode`] never
//! attempts to resynchronise.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{self, Framed};

use super::frame::{tag, Frame, Listing, WireRusage};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Wraps a byte stream in the frame protocol's `Framed` transport.
pub fn framed<T: AsyncRead + AsyncWrite>(stream: T) -> Framed<T, FrameCodec> {
    Framed::new(stream, FrameCodec::default())
}

#[derive(Debug, Default)]
pub struct FrameCodec;

/// A read-only cursor over buffered bytes, used to determine whether a whole
/// frame is present before committing to consuming it from the real buffer.
/// Every getter returns `None` (without side effects useful to the caller)
/// if insufficient bytes remain, which [`FrameCodec::decode`] treats as "wait
/// for more data".
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u32(&mut self) -> Option<u32> {
        let s = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_ne_bytes(s.try_into().unwrap()))
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let s = self.buf.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(s)
    }

    fn len_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }
}

/// Attempts to parse one complete frame from `buf`. Returns `Ok(None)` if
/// `buf` doesn't yet hold a whole frame (the caller should wait for more
/// bytes), `Ok(Some((frame, consumed)))` on success, or `Err` on a malformed
/// or unrecognised frame (which the caller must treat as fatal to the
/// connection).
fn try_parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    let mut c = Cursor::new(buf);
    let Some(t) = c.u8() else {
        return Ok(None);
    };

    macro_rules! need {
        ($e:expr) => {
            match $e {
                Some(v) => v,
                None => return Ok(None),
            }
        };
    }

    let frame = match t {
        tag::ACK => Frame::Ack,
        tag::NACK => Frame::Nack,
        tag::LOGIN => {
            let name = need!(c.len_prefixed()).to_vec();
            Frame::Login { name }
        },
        tag::JOB_SUBMIT => {
            let maxcpu = need!(c.u32());
            let maxmem = need!(c.u32());
            let priority = need!(c.i32());
            let cmd = need!(c.len_prefixed()).to_vec();
            let envc = need!(c.u32());
            let mut envp = Vec::with_capacity(envc as usize);
            for _ in 0..envc {
                envp.push(need!(c.len_prefixed()).to_vec());
            }
            Frame::JobSubmit {
                maxcpu,
                maxmem,
                priority,
                cmd,
                envp,
            }
        },
        tag::JOB_STATUS => Frame::JobStatus {
            jobid: need!(c.u32()),
        },
        tag::JOB_SIGNAL => Frame::JobSignal {
            jobid: need!(c.u32()),
            signum: need!(c.u32()),
        },
        tag::JOB_SET_PRI => Frame::JobSetPri {
            jobid: need!(c.u32()),
            priority: need!(c.i32()),
        },
        tag::JOB_GET_STDOUT => Frame::JobGetStdout {
            jobid: need!(c.u32()),
        },
        tag::JOB_GET_STDERR => Frame::JobGetStderr {
            jobid: need!(c.u32()),
        },
        tag::JOB_LIST_ALL => Frame::JobListAll,
        tag::JOB_EXPUNGE => Frame::JobExpunge {
            jobid: need!(c.u32()),
        },
        tag::JOB_SUBMIT_SUCCESS => Frame::JobSubmitSuccess {
            jobid: need!(c.u32()),
        },
        tag::JOB_STATUS_RESP => {
            let status = need!(c.u32());
            let exitcode = need!(c.i32());
            let maxcpu = need!(c.u32());
            let maxmem = need!(c.u32());
            let priority = need!(c.i32());
            let rusage = WireRusage {
                utime_secs: need!(c.u32()),
                utime_micros: need!(c.u32()),
                stime_secs: need!(c.u32()),
                stime_micros: need!(c.u32()),
                maxrss_kb: need!(c.u32()),
            };
            Frame::JobStatusResp {
                status,
                exitcode,
                maxcpu,
                maxmem,
                priority,
                rusage,
            }
        },
        tag::JOB_UPDATE => Frame::JobUpdate {
            jobid: need!(c.u32()),
            status: need!(c.u32()),
        },
        tag::JOB_LIST_ALL_RESP => {
            let mut listing = Vec::new();
            loop {
                let jobid = need!(c.u32());
                let left = need!(c.u32());
                let cmd = need!(c.len_prefixed()).to_vec();
                let status = need!(c.u32());
                let exitcode = need!(c.i32());
                let done = left == 0;
                listing.push(Listing {
                    jobid,
                    left,
                    cmd,
                    status,
                    exitcode,
                });
                if done {
                    break;
                }
            }
            Frame::JobListAllResp { listing }
        },
        tag::JOB_RESULTS => {
            let content = need!(c.len_prefixed()).to_vec();
            Frame::JobResults { content }
        },
        other => return Err(FrameError::UnknownTag(other)),
    };

    Ok(Some((frame, c.pos)))
}

fn put_len_prefixed(dst: &mut BytesMut, bytes: &[u8]) {
    dst.put_u32_ne(bytes.len() as u32);
    dst.put_slice(bytes);
}

fn encode_frame(item: &Frame, dst: &mut BytesMut) {
    dst.put_u8(item.tag());
    match item {
        Frame::Ack | Frame::Nack | Frame::JobListAll => {},
        Frame::Login { name } => put_len_prefixed(dst, name),
        Frame::JobSubmit {
            maxcpu,
            maxmem,
            priority,
            cmd,
            envp,
        } => {
            dst.put_u32_ne(*maxcpu);
            dst.put_u32_ne(*maxmem);
            dst.put_i32_ne(*priority);
            put_len_prefixed(dst, cmd);
            dst.put_u32_ne(envp.len() as u32);
            for var in envp {
                put_len_prefixed(dst, var);
            }
        },
        Frame::JobStatus { jobid }
        | Frame::JobGetStdout { jobid }
        | Frame::JobGetStderr { jobid }
        | Frame::JobExpunge { jobid }
        | Frame::JobSubmitSuccess { jobid } => dst.put_u32_ne(*jobid),
        Frame::JobSignal { jobid, signum } => {
            dst.put_u32_ne(*jobid);
            dst.put_u32_ne(*signum);
        },
        Frame::JobSetPri { jobid, priority } => {
            dst.put_u32_ne(*jobid);
            dst.put_i32_ne(*priority);
        },
        Frame::JobStatusResp {
            status,
            exitcode,
            maxcpu,
            maxmem,
            priority,
            rusage,
        } => {
            dst.put_u32_ne(*status);
            dst.put_i32_ne(*exitcode);
            dst.put_u32_ne(*maxcpu);
            dst.put_u32_ne(*maxmem);
            dst.put_i32_ne(*priority);
            dst.put_u32_ne(rusage.utime_secs);
            dst.put_u32_ne(rusage.utime_micros);
            dst.put_u32_ne(rusage.stime_secs);
            dst.put_u32_ne(rusage.stime_micros);
            dst.put_u32_ne(rusage.maxrss_kb);
        },
        Frame::JobUpdate { jobid, status } => {
            dst.put_u32_ne(*jobid);
            dst.put_u32_ne(*status);
        },
        Frame::JobListAllResp { listing } => {
            for rec in listing {
                dst.put_u32_ne(rec.jobid);
                dst.put_u32_ne(rec.left);
                put_len_prefixed(dst, &rec.cmd);
                dst.put_u32_ne(rec.status);
                dst.put_i32_ne(rec.exitcode);
            }
        },
        Frame::JobResults { content } => put_len_prefixed(dst, content),
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match try_parse(src.as_ref())? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            },
            None => Ok(None),
        }
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_frame(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf);
        let (decoded, consumed) = try_parse(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_simple_frames() {
        roundtrip(Frame::Ack);
        roundtrip(Frame::Nack);
        roundtrip(Frame::JobListAll);
        roundtrip(Frame::Login {
            name: b"alice".to_vec(),
        });
        roundtrip(Frame::JobStatus { jobid: 7 });
        roundtrip(Frame::JobSignal {
            jobid: 3,
            signum: 9,
        });
        roundtrip(Frame::JobSetPri {
            jobid: 1,
            priority: -5,
        });
        roundtrip(Frame::JobSubmitSuccess { jobid: 42 });
        roundtrip(Frame::JobUpdate {
            jobid: 2,
            status: 1,
        });
    }

    #[test]
    fn roundtrip_job_submit_with_env() {
        roundtrip(Frame::JobSubmit {
            maxcpu: 60,
            maxmem: 1 << 20,
            priority: 0,
            cmd: b"sleep 5".to_vec(),
            envp: vec![b"PATH=/bin".to_vec(), b"HOME=/home/alice".to_vec()],
        });
    }

    #[test]
    fn roundtrip_job_status_resp() {
        roundtrip(Frame::JobStatusResp {
            status: 3,
            exitcode: 0,
            maxcpu: 10,
            maxmem: 100,
            priority: 0,
            rusage: WireRusage {
                utime_secs: 1,
                utime_micros: 2,
                stime_secs: 3,
                stime_micros: 4,
                maxrss_kb: 1024,
            },
        });
    }

    #[test]
    fn roundtrip_job_results() {
        roundtrip(Frame::JobResults {
            content: b"hello\n".to_vec(),
        });
        roundtrip(Frame::JobResults { content: vec![] });
    }

    #[test]
    fn list_framing_terminates_on_left_zero() {
        let listing = vec![
            Listing {
                jobid: 0,
                left: 1,
                cmd: b"a".to_vec(),
                status: 3,
                exitcode: 0,
            },
            Listing {
                jobid: 1,
                left: 0,
                cmd: b"b".to_vec(),
                status: 1,
                exitcode: 0,
            },
        ];
        roundtrip(Frame::JobListAllResp { listing });
    }

    #[test]
    fn partial_frame_yields_none_not_error() {
        let mut buf = BytesMut::new();
        encode_frame(
            &Frame::Login {
                name: b"bob".to_vec(),
            },
            &mut buf,
        );
        // Feed one byte at a time; decode must never error, only ask for more
        // until the whole frame has arrived.
        let mut codec = FrameCodec;
        let mut partial = BytesMut::new();
        let mut result = None;
        for i in 0..buf.len() {
            partial.extend_from_slice(&buf[i..i + 1]);
            result = codec::Decoder::decode(&mut codec, &mut partial).unwrap();
            if result.is_some() {
                assert_eq!(i, buf.len() - 1, "frame completed before all bytes arrived");
            }
        }
        assert_eq!(
            result,
            Some(Frame::Login {
                name: b"bob".to_vec()
            })
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[200u8][..]);
        let err = codec::Decoder::decode(&mut codec, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::UnknownTag(200)));
    }

    // Drives the decoder over a scripted `AsyncRead` that delivers two frames
    // split into arbitrary chunks across several reads, the way bytes
    // actually arrive off a socket.
    #[tokio::test]
    async fn framed_read_handles_fragmented_delivery() {
        let mut wire = BytesMut::new();
        encode_frame(
            &Frame::Login {
                name: b"alice".to_vec(),
            },
            &mut wire,
        );
        encode_frame(&Frame::JobStatus { jobid: 7 }, &mut wire);
        let wire = wire.freeze();

        let mut builder = tokio_test::io::Builder::new();
        for chunk in wire.chunks(3) {
            builder.read(chunk);
        }
        let mock = builder.build();

        let mut framed = FramedRead::new(mock, FrameCodec);

        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            Frame::Login {
                name: b"alice".to_vec()
            }
        );
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            Frame::JobStatus { jobid: 7 }
        );
        assert!(framed.next().await.is_none());
    }
}
