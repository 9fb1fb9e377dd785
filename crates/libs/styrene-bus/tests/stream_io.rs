use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use styrene_bus::crypt::SESSION_KEY_LEN;
use styrene_bus::{
    read_message_async, write_message_async, Arg, BodyCipher, BusContext, BusError, CodecConfig,
    IoSink, IoSource, Message, MessageBuilder, MessageFlags, MessageReader, MessageWriter,
    SessionKeyCipher, WriteState,
};

const SESSION_KEY: [u8; SESSION_KEY_LEN] = [0x42; SESSION_KEY_LEN];

fn encrypted_call(context: &BusContext) -> Message {
    context
        .compose(
            context
                .method_call(":1.2", "/vault", "com.example.Vault", "Store")
                .flags(MessageFlags::ENCRYPTED)
                .args("s", vec![Arg::string("secret payload").expect("arg")]),
        )
        .expect("compose")
}

#[test]
fn encrypted_call_roundtrips_between_endpoints() {
    let sender_keys = Arc::new(SessionKeyCipher::new());
    sender_keys.set_peer_key(":1.2", SESSION_KEY);
    let sender = BusContext::new(":1.1", CodecConfig::default()).with_cipher(sender_keys);

    let call = encrypted_call(&sender);
    let plaintext_len = call.body_len();
    let mut writer = sender.writer(call);
    let mut sink = IoSink(Vec::new());
    writer.write_blocking(&mut sink, Some(Duration::from_secs(1))).expect("write");
    assert_eq!(writer.state(), WriteState::Complete);
    assert!(writer.message().is_body_encrypted());
    assert_ne!(writer.message().body_len(), plaintext_len);
    let wire = sink.0;
    assert!(!wire.windows(6).any(|window| window == b"secret"));

    let receiver_keys = SessionKeyCipher::new();
    receiver_keys.set_peer_key(":1.1", SESSION_KEY);
    let receiver = BusContext::new(":1.2", CodecConfig::default());
    let mut reader = receiver.reader_for_endpoint(":1.1");
    let mut message =
        reader.read_blocking(&mut IoSource(Cursor::new(wire)), None).expect("read");
    assert!(matches!(message.args(), Err(BusError::EncryptedBody)));

    let cipher: &dyn BodyCipher = &receiver_keys;
    let args = message.unmarshal_args(Some(cipher), Some("s")).expect("decrypt");
    assert_eq!(args[0].get::<&str>().expect("text"), "secret payload");
}

#[test]
fn pending_key_agreement_leaves_writer_retryable() {
    let keys = Arc::new(SessionKeyCipher::new());
    keys.mark_pending(":1.2");
    let context = BusContext::new(":1.1", CodecConfig::default()).with_cipher(keys.clone());

    let mut writer = context.writer(encrypted_call(&context));
    let mut sink = IoSink(Vec::new());
    assert!(matches!(writer.push(&mut sink), Err(BusError::AuthenticationPending(_))));
    assert_eq!(writer.state(), WriteState::New);
    assert!(sink.0.is_empty());

    keys.set_peer_key(":1.2", SESSION_KEY);
    writer.push(&mut sink).expect("retry");
    assert_eq!(writer.state(), WriteState::Complete);
    assert_eq!(sink.0.len(), writer.message().as_bytes().len());
}

#[test]
fn spoofed_sender_is_refused_unless_checks_are_off() {
    let context = BusContext::new(":1.4", CodecConfig::default());
    let signal = context
        .compose(context.signal("", "/obj", "com.example.Iface", "Changed"))
        .expect("signal");
    let wire = signal.into_bytes();

    let mut reader = context.reader_for_endpoint(":1.5");
    assert!(matches!(
        reader.read_blocking(&mut IoSource(Cursor::new(wire.clone())), None),
        Err(BusError::BusNotAuthorized { .. })
    ));

    let relaxed = CodecConfig { check_sender: false, ..CodecConfig::default() };
    let mut reader = BusContext::new(":1.9", relaxed).reader_for_endpoint(":1.5");
    let message = reader.read_blocking(&mut IoSource(Cursor::new(wire)), None).expect("read");
    assert_eq!(message.sender(), ":1.4");
}

#[test]
fn missing_sender_is_filled_from_endpoint() {
    let anonymous = MessageBuilder::signal("", "/obj", "com.example.Iface", "Changed")
        .serial(5)
        .build()
        .expect("signal");
    let context = BusContext::new(":1.2", CodecConfig::default());
    let mut reader = context.reader_for_endpoint(":1.7");
    let message = reader
        .read_blocking(&mut IoSource(Cursor::new(anonymous.into_bytes())), None)
        .expect("read");
    assert_eq!(message.sender(), ":1.7");
}

#[test]
fn expired_messages_rejected_when_configured() {
    let stale = MessageBuilder::signal("", "/obj", "com.example.Iface", "Changed")
        .serial(5)
        .time_to_live(1)
        .build()
        .expect("signal");
    std::thread::sleep(Duration::from_millis(20));

    let strict = CodecConfig { reject_expired: true, ..CodecConfig::default() };
    let mut reader = BusContext::new(":1.2", strict).reader();
    assert!(matches!(reader.feed(stale.as_bytes()), Err(BusError::TimeToLiveExpired)));

    let mut reader = BusContext::new(":1.2", CodecConfig::default()).reader();
    reader.feed(stale.as_bytes()).expect("lenient");
    assert!(reader.take().expect("message").is_expired());
}

#[tokio::test]
async fn async_stream_carries_back_to_back_messages() {
    let context = BusContext::new(":1.1", CodecConfig::default());
    let (mut client, mut server) = tokio::io::duplex(64);

    let first = context
        .compose(
            context
                .method_call("com.example.Foo", "/obj", "com.example.Iface", "Ping")
                .args("u", vec![Arg::Uint32(1)]),
        )
        .expect("first");
    let second = context
        .compose(
            context
                .method_call("com.example.Foo", "/obj", "com.example.Iface", "Ping")
                .args("u", vec![Arg::Uint32(2)]),
        )
        .expect("second");
    let expected = (first.serial(), second.serial());

    let sender = tokio::spawn(async move {
        for message in [first, second] {
            let mut writer = MessageWriter::new(message);
            write_message_async(&mut client, &mut writer).await.expect("write");
        }
    });

    let mut reader = MessageReader::new(&CodecConfig::default());
    let one = read_message_async(&mut server, &mut reader).await.expect("read one");
    let two = read_message_async(&mut server, &mut reader).await.expect("read two");
    sender.await.expect("sender task");

    assert_eq!((one.serial(), two.serial()), expected);
    assert_eq!(two.args().expect("args")[0].get::<u32>().expect("u32"), 2);
}
