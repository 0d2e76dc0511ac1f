//! Message-level encoding and the framed codec.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::commands::{
    ChangeableInstrParams, ClassLoaded, EventBufferDumped, GetClassId, GetMethodNames,
    InitiateProfiling, InstrumentMethodGroup, MethodInvokedFirstTime, RootClassLoaded,
    TakeHeapDump,
};
use super::format::{WireReader, WireWriter};
use super::responses::{
    ClassIdResponse, InstrumentationResult, MethodNames, MonitoredNumbers, StatusResponse,
    VmProperties,
};
use super::{Command, CommandKind, Message, Response, ResponseKind, SimpleCommand, family};
use crate::error::{CodecError, DecodeError, EncodeError};

/// Encodes one message into a fresh buffer.
pub fn encode(message: &Message) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::new();
    encode_into(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Appends one encoded message to `dst`. On error `dst` is left as it was.
pub fn encode_into(message: &Message, dst: &mut BytesMut) -> Result<(), EncodeError> {
    match message {
        Message::Command(command) => encode_command_into(command, dst),
        Message::Response(response) => encode_response_into(response, dst),
    }
}

fn encode_command_into(command: &Command, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let start = dst.len();
    let result = write_command(command, &mut WireWriter::new(dst));
    if result.is_err() {
        dst.truncate(start);
    }
    result
}

fn encode_response_into(response: &Response, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let start = dst.len();
    let result = write_response(response, &mut WireWriter::new(dst));
    if result.is_err() {
        dst.truncate(start);
    }
    result
}

fn write_command(command: &Command, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
    if let Command::Simple(simple) = command {
        w.put_u8(family::SIMPLE_COMMAND);
        w.put_i32(simple.opcode());
        return Ok(());
    }

    w.put_u8(family::COMPLEX_COMMAND);
    w.put_i32(command.kind().map_or(0, |kind| kind as i32));
    match command {
        Command::Simple(_) => Ok(()),
        Command::RootClassLoaded(batch) => batch.encode(w),
        Command::ClassLoaded(class) => class.encode(w),
        Command::MethodInvokedFirstTime(invoked) => {
            w.put_i32(invoked.method_id);
            Ok(())
        }
        Command::InstrumentMethodGroup(group) => group.encode(w),
        Command::InitiateProfiling(initiate) => initiate.encode(w),
        Command::GetMethodNamesForJMethodIds(request) => {
            w.put_i32_array("method_ids", &request.method_ids)
        }
        Command::EventBufferDumped(dumped) => {
            w.put_i32(dumped.buffer_size);
            Ok(())
        }
        Command::GetClassId(request) => {
            w.put_string("class_name", &request.class_name)?;
            w.put_i32(request.loader_id);
            Ok(())
        }
        Command::SetChangeableInstrParams(params) => {
            params.encode(w);
            Ok(())
        }
        Command::TakeHeapDump(dump) => w.put_string("output_file", &dump.output_file),
    }
}

fn write_response(response: &Response, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
    let kind = match response {
        Response::Status(status) => {
            w.put_u8(family::STATUS_RESPONSE);
            return status.encode(w);
        }
        Response::InstrumentMethodGroup(_) => ResponseKind::InstrumentMethodGroup,
        Response::MonitoredNumbers(_) => ResponseKind::MonitoredNumbers,
        Response::MethodNames(_) => ResponseKind::MethodNames,
        Response::ClassId(_) => ResponseKind::ClassId,
        Response::VmProperties(_) => ResponseKind::VmProperties,
    };

    w.put_u8(family::COMPLEX_RESPONSE);
    w.put_i32(kind as i32);
    match response {
        Response::Status(_) => Ok(()),
        Response::InstrumentMethodGroup(result) => result.encode(w),
        Response::MonitoredNumbers(numbers) => numbers.encode(w),
        Response::MethodNames(names) => names.encode(w),
        Response::ClassId(class_id) => {
            class_id.encode(w);
            Ok(())
        }
        Response::VmProperties(props) => props.encode(w),
    }
}

/// Decodes exactly one message; leftover bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let (message, consumed) = decode_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(DecodeError::TrailingBytes { trailing: bytes.len() - consumed });
    }
    Ok(message)
}

/// Decodes the message at the start of `bytes` and reports how many bytes it used.
///
/// Returns [`DecodeError::Truncated`] when `bytes` holds only part of a frame. Every other
/// error means the input can never become a valid frame.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Message, usize), DecodeError> {
    let mut r = WireReader::new(bytes);
    let family_tag = r.read_u8()?;
    if !(family::SIMPLE_COMMAND..=family::COMPLEX_RESPONSE).contains(&family_tag) {
        let kind = r.read_i32().unwrap_or_default();
        return Err(DecodeError::UnknownKind { family: family_tag, kind });
    }
    let tag = r.read_i32()?;

    let message = match family_tag {
        family::SIMPLE_COMMAND => Message::Command(Command::Simple(SimpleCommand::from_opcode(tag)?)),
        family::COMPLEX_COMMAND => {
            Message::Command(read_command(CommandKind::from_tag(tag)?, &mut r)?)
        }
        family::STATUS_RESPONSE => {
            Message::Response(Response::Status(StatusResponse::decode(tag, &mut r)?))
        }
        _ => Message::Response(read_response(ResponseKind::from_tag(tag)?, &mut r)?),
    };
    Ok((message, r.position()))
}

fn read_command(kind: CommandKind, r: &mut WireReader<'_>) -> Result<Command, DecodeError> {
    Ok(match kind {
        CommandKind::RootClassLoaded => Command::RootClassLoaded(RootClassLoaded::decode(r)?),
        CommandKind::ClassLoaded => Command::ClassLoaded(ClassLoaded::decode(r)?),
        CommandKind::MethodInvokedFirstTime => {
            Command::MethodInvokedFirstTime(MethodInvokedFirstTime { method_id: r.read_i32()? })
        }
        CommandKind::InstrumentMethodGroup => {
            Command::InstrumentMethodGroup(InstrumentMethodGroup::decode(r)?)
        }
        CommandKind::InitiateProfiling => {
            Command::InitiateProfiling(InitiateProfiling::decode(r)?)
        }
        CommandKind::GetMethodNamesForJMethodIds => {
            Command::GetMethodNamesForJMethodIds(GetMethodNames {
                method_ids: r.read_i32_array("method_ids")?,
            })
        }
        CommandKind::EventBufferDumped => {
            Command::EventBufferDumped(EventBufferDumped { buffer_size: r.read_i32()? })
        }
        CommandKind::GetClassId => Command::GetClassId(GetClassId {
            class_name: r.read_string("class_name")?,
            loader_id: r.read_i32()?,
        }),
        CommandKind::SetChangeableInstrParams => {
            Command::SetChangeableInstrParams(ChangeableInstrParams::decode(r)?)
        }
        CommandKind::TakeHeapDump => {
            Command::TakeHeapDump(TakeHeapDump { output_file: r.read_string("output_file")? })
        }
    })
}

fn read_response(kind: ResponseKind, r: &mut WireReader<'_>) -> Result<Response, DecodeError> {
    Ok(match kind {
        ResponseKind::InstrumentMethodGroup => {
            Response::InstrumentMethodGroup(InstrumentationResult::decode(r)?)
        }
        ResponseKind::MonitoredNumbers => Response::MonitoredNumbers(MonitoredNumbers::decode(r)?),
        ResponseKind::MethodNames => Response::MethodNames(MethodNames::decode(r)?),
        ResponseKind::ClassId => Response::ClassId(ClassIdResponse::decode(r)?),
        ResponseKind::VmProperties => Response::VmProperties(VmProperties::decode(r)?),
    })
}

/// Framing codec for `tokio_util::codec::{FramedRead, FramedWrite}`.
///
/// Frames have no outer length, so a partial frame is re-parsed when more bytes arrive.
/// The codec remembers the minimum length the last attempt asked for and skips parsing
/// until the buffer reaches it.
#[derive(Debug, Default, Clone)]
pub struct WireCodec {
    min_frame_len: usize,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

// Upper bound for buffer growth requested from a single truncation hint.
const MAX_RESERVE: usize = 64 * 1024;

impl Decoder for WireCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() || src.len() < self.min_frame_len {
            return Ok(None);
        }
        match decode_prefix(src) {
            Ok((message, consumed)) => {
                trace!(consumed, buffered = src.len(), "decoded frame");
                src.advance(consumed);
                self.min_frame_len = 0;
                Ok(Some(message))
            }
            Err(DecodeError::Truncated { needed, available }) => {
                self.min_frame_len = needed;
                src.reserve(needed.saturating_sub(available).min(MAX_RESERVE));
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() => Ok(None),
            None => Err(DecodeError::Truncated {
                needed: self.min_frame_len.max(buf.len() + 1),
                available: buf.len(),
            }
            .into()),
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(encode_into(&item, dst)?)
    }
}

impl<'a> Encoder<&'a Command> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &'a Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(encode_command_into(item, dst)?)
    }
}

impl<'a> Encoder<&'a Response> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &'a Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(encode_response_into(item, dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstrumentationType, LoadedClass, MethodSignature};
    use crate::wire::ClassReplacement;
    use bytes::BufMut;
    use proptest::prelude::*;

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-z]{1,4}(\\.[A-Z][a-zA-Z0-9$]{0,6}){1,2}"
    }

    fn arb_text() -> impl Strategy<Value = String> {
        ".{0,12}"
    }

    fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..32)
    }

    fn arb_instr_type() -> impl Strategy<Value = InstrumentationType> {
        (0i32..=6).prop_map(|code| InstrumentationType::from_code(code).unwrap())
    }

    fn arb_loaded_class() -> impl Strategy<Value = LoadedClass> {
        (arb_name(), any::<i32>(), any::<i32>(), arb_bytes())
            .prop_map(|(name, loader, parent, bytes)| LoadedClass::new(name, loader, parent, bytes))
    }

    fn arb_command() -> impl Strategy<Value = Command> {
        prop_oneof![
            prop::sample::select(SimpleCommand::ALL.to_vec()).prop_map(Command::Simple),
            prop::collection::vec(arb_loaded_class(), 0..4)
                .prop_map(|classes| Command::RootClassLoaded(RootClassLoaded { classes })),
            arb_loaded_class().prop_map(|class| Command::ClassLoaded(ClassLoaded { class })),
            any::<i32>().prop_map(|method_id| {
                Command::MethodInvokedFirstTime(MethodInvokedFirstTime { method_id })
            }),
            (arb_instr_type(), prop::collection::vec((arb_name(), any::<i32>(), arb_bytes()), 0..4))
                .prop_map(|(instr_type, classes)| {
                    Command::InstrumentMethodGroup(InstrumentMethodGroup {
                        instr_type,
                        classes: classes
                            .into_iter()
                            .map(|(n, l, b)| ClassReplacement::new(n, l, b))
                            .collect(),
                    })
                }),
            (arb_instr_type(), prop::collection::vec(arb_name(), 0..4), any::<bool>()).prop_map(
                |(instr_type, root_class_names, instrument_spawned_threads)| {
                    Command::InitiateProfiling(InitiateProfiling {
                        instr_type,
                        root_class_names,
                        instrument_spawned_threads,
                    })
                }
            ),
            prop::collection::vec(any::<i32>(), 0..8).prop_map(|method_ids| {
                Command::GetMethodNamesForJMethodIds(GetMethodNames { method_ids })
            }),
            any::<i32>()
                .prop_map(|buffer_size| Command::EventBufferDumped(EventBufferDumped { buffer_size })),
            (arb_name(), any::<i32>()).prop_map(|(class_name, loader_id)| {
                Command::GetClassId(GetClassId { class_name, loader_id })
            }),
            (any::<bool>(), any::<i32>(), any::<i32>()).prop_map(|(lock, sampling, threads)| {
                Command::SetChangeableInstrParams(ChangeableInstrParams {
                    lock_contention_monitoring: lock,
                    sampling_interval_ms: sampling,
                    thread_sampling_interval_ms: threads,
                })
            }),
            arb_text().prop_map(|output_file| Command::TakeHeapDump(TakeHeapDump { output_file })),
        ]
    }

    fn arb_instrumentation_result() -> impl Strategy<Value = InstrumentationResult> {
        (
            prop::collection::vec(
                (arb_name(), prop::collection::vec(any::<i32>(), 0..4), prop::option::of(arb_bytes())),
                0..4,
            ),
            prop::collection::vec((arb_name(), arb_text()), 0..2),
        )
            .prop_map(|(classes, errors)| {
                let mut result = InstrumentationResult::new();
                for (name, ids, bytes) in classes {
                    result.push_class(name, ids, bytes.map(Bytes::from));
                }
                for (name, message) in errors {
                    result.record_error(name, message);
                }
                result
            })
    }

    fn arb_response() -> impl Strategy<Value = Response> {
        prop_oneof![
            (any::<bool>(), prop::option::of(arb_text())).prop_map(|(ok, error_message)| {
                Response::Status(StatusResponse { ok, error_message })
            }),
            arb_instrumentation_result().prop_map(Response::InstrumentMethodGroup),
            (
                prop::collection::vec(any::<i64>(), 0..12),
                prop::collection::vec(any::<i64>(), 0..4),
                prop::collection::vec(any::<i64>(), 0..4),
            )
                .prop_map(|(general_numbers, gc_starts, gc_finishes)| {
                    Response::MonitoredNumbers(MonitoredNumbers {
                        general_numbers,
                        gc_starts,
                        gc_finishes,
                    })
                }),
            prop::collection::vec((arb_name(), "[a-z]{1,6}", "\\([IJZ]*\\)V"), 0..4).prop_map(
                |methods| {
                    Response::MethodNames(MethodNames {
                        methods: methods
                            .into_iter()
                            .map(|(c, m, s)| MethodSignature::new(c, m, s))
                            .collect(),
                    })
                }
            ),
            prop::option::of(any::<i32>())
                .prop_map(|class_id| Response::ClassId(ClassIdResponse { class_id })),
            (arb_text(), arb_text(), any::<i64>(), any::<i64>()).prop_map(
                |(java_version, java_command, max_heap_size, start_time)| {
                    Response::VmProperties(VmProperties {
                        java_version,
                        vm_version: "25.0".to_string(),
                        java_command,
                        jvm_arguments: String::new(),
                        max_heap_size,
                        start_time,
                    })
                }
            ),
        ]
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![arb_command().prop_map(Message::Command), arb_response().prop_map(Message::Response)]
    }

    proptest! {
        #[test]
        fn every_message_survives_a_round_trip(message in arb_message()) {
            let bytes = encode(&message).unwrap();
            prop_assert_eq!(decode(&bytes).unwrap(), message);
        }

        #[test]
        fn every_strict_prefix_is_truncated(message in arb_message()) {
            let bytes = encode(&message).unwrap();
            for cut in 0..bytes.len() {
                let is_truncated = matches!(decode_prefix(&bytes[..cut]), Err(DecodeError::Truncated { .. }));
                prop_assert!(is_truncated, "prefix of {} bytes", cut);
            }
        }

        #[test]
        fn codec_reassembles_frames_split_at_any_point(
            messages in prop::collection::vec(arb_message(), 1..4),
            chunk in 1usize..16,
        ) {
            let mut wire = BytesMut::new();
            for message in &messages {
                encode_into(message, &mut wire).unwrap();
            }

            let mut codec = WireCodec::new();
            let mut buffer = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in wire.chunks(chunk) {
                buffer.extend_from_slice(piece);
                while let Some(message) = codec.decode(&mut buffer).unwrap() {
                    decoded.push(message);
                }
            }
            prop_assert!(codec.decode_eof(&mut buffer).unwrap().is_none());
            prop_assert_eq!(decoded, messages);
        }
    }

    #[test]
    fn opcode_zero_and_out_of_range_are_rejected() {
        for opcode in [0, 999] {
            let mut buf = BytesMut::new();
            buf.put_u8(family::SIMPLE_COMMAND);
            buf.put_i32(opcode);
            assert_eq!(decode(&buf), Err(DecodeError::InvalidOpcode { opcode }));
        }
    }

    #[test]
    fn unknown_family_is_rejected_without_waiting_for_more_bytes() {
        assert_eq!(decode(&[9]), Err(DecodeError::UnknownKind { family: 9, kind: 0 }));
        assert_eq!(
            decode(&[0, 0, 0, 0, 5]),
            Err(DecodeError::UnknownKind { family: 0, kind: 5 })
        );
    }

    #[test]
    fn unknown_complex_kind_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(family::COMPLEX_RESPONSE);
        buf.put_i32(42);
        assert_eq!(
            decode(&buf),
            Err(DecodeError::UnknownKind { family: family::COMPLEX_RESPONSE, kind: 42 })
        );
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let mut buf = BytesMut::from(&encode(&Command::Simple(SimpleCommand::RunGc).into()).unwrap()[..]);
        buf.put_u8(0xAA);
        assert_eq!(decode(&buf), Err(DecodeError::TrailingBytes { trailing: 1 }));
        let (message, consumed) = decode_prefix(&buf).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(message, Message::Command(Command::Simple(SimpleCommand::RunGc)));
    }

    #[test]
    fn truncated_frame_at_end_of_stream_is_an_error() {
        let frame = encode(&Response::error("agent busy").into()).unwrap();
        let mut buf = BytesMut::from(&frame[..frame.len() - 2]);
        let mut codec = WireCodec::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Decode(DecodeError::Truncated { .. })));
    }

    #[test]
    fn oversized_field_leaves_output_untouched() {
        let mut dst = BytesMut::from(&b"prefix"[..]);
        let huge = Command::GetMethodNamesForJMethodIds(GetMethodNames {
            method_ids: vec![0; crate::wire::MAX_ARRAY_LEN + 1],
        });
        let err = encode_into(&huge.into(), &mut dst).unwrap_err();
        assert!(matches!(err, EncodeError::TooLarge { field: "method_ids", .. }));
        assert_eq!(&dst[..], b"prefix");
    }

    #[test]
    fn status_response_layout() {
        let bytes = encode(&Response::ok().into()).unwrap();
        assert_eq!(&bytes[..], &[3, 0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff]);
    }
}
