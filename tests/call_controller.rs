mod common;

use airing_call_lib::audio::{AudioFrame, CaptureBackend, PlaybackBackend};
use airing_call_lib::call_engine::{
    CallController, CallDeps, CallError, CallEvent, CallFailure, CallState, EndReason,
};
use airing_call_lib::transport::{EncodedAudioChunk, ServerUpdate, Transport, TransportState};
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    call: CallController,
    events: mpsc::UnboundedReceiver<CallEvent>,
    transport: Arc<FakeTransport>,
    mic: FakeMic,
    speaker: SpeakerBackend,
}

fn start_call(mic: FakeMic) -> Harness {
    let (transport, transport_events) = FakeTransport::new();
    let speaker = SpeakerBackend::default();

    let (call, events) = CallController::start(
        "wss://x",
        fast_policy(),
        CallDeps {
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            transport_events,
            capture: Arc::new(mic.clone()) as Arc<dyn CaptureBackend>,
            playback: Arc::new(speaker.clone()) as Arc<dyn PlaybackBackend>,
        },
    )
    .unwrap();

    Harness {
        call,
        events,
        transport,
        mic,
        speaker,
    }
}

async fn connected_call() -> Harness {
    let mut h = start_call(FakeMic::new());
    h.transport.open();
    wait_for_event(&mut h.events, |e| {
        matches!(e, CallEvent::ConnectionChanged { connected: true, .. })
    })
    .await;
    h
}

fn audio_update(marker: i16) -> ServerUpdate {
    ServerUpdate {
        text: None,
        audio: Some(EncodedAudioChunk::encode(&AudioFrame::new(vec![marker; 240]))),
    }
}

#[tokio::test]
async fn test_full_call_scenario() {
    let mut h = start_call(FakeMic::new());

    let first = wait_for_event(&mut h.events, |_| true).await;
    assert!(matches!(first, CallEvent::StateChanged { state: CallState::Connecting }));
    assert_eq!(h.transport.connects(), vec!["wss://x".to_string()]);

    h.transport.open();
    wait_for_event(&mut h.events, |e| {
        matches!(e, CallEvent::StateChanged { state: CallState::Connected })
    })
    .await;

    // Mikrofon startet automatisch
    wait_until(|| h.mic.opens() == 1).await;

    h.mic.push(frame(1));
    h.mic.push(frame(2));
    h.mic.push(frame(3));
    wait_until(|| h.transport.sent().len() == 3).await;
    assert_eq!(sent_markers(&h.transport.sent()), vec![1, 2, 3]);

    // Empfangenes Audio wird abgespielt
    h.transport.deliver(audio_update(9));
    wait_until(|| h.speaker.speaker.played_markers() == vec![9]).await;

    let summary = h.call.hang_up().await.expect("first hang-up returns a summary");
    assert_eq!(summary.end_reason, EndReason::HungUp);

    let sent = h.transport.sent();
    assert_eq!(count_messages(&sent), (3, 1));
    assert!(sent.last().unwrap().is_end_of_stream());

    assert_eq!(h.transport.closes(), 1);
    assert_eq!(h.transport.state(), TransportState::Closed);
    assert!(h.speaker.speaker.halts.load(Ordering::SeqCst) >= 1);

    let ended = wait_for_event(&mut h.events, |e| matches!(e, CallEvent::Ended(_))).await;
    match ended {
        CallEvent::Ended(ended) => assert_eq!(ended.call_id, h.call.id()),
        _ => unreachable!(),
    }
    assert!(matches!(h.call.snapshot().await, Err(CallError::CallEnded)));
}

#[tokio::test]
async fn test_hang_up_twice_is_a_noop() {
    let h = connected_call().await;

    assert!(h.call.hang_up().await.is_some());
    assert!(h.call.hang_up().await.is_none());
    assert!(h.call.hang_up().await.is_none());
    assert_eq!(h.transport.closes(), 1);
    assert!(!h.call.is_active());
}

#[tokio::test]
async fn test_hang_up_while_connecting() {
    let h = start_call(FakeMic::new());

    let summary = h.call.hang_up().await.unwrap();
    assert_eq!(summary.end_reason, EndReason::HungUp);

    // Nie verbunden: kein end_of_stream, kein Mikrofon
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.mic.opens(), 0);
}

#[tokio::test]
async fn test_disconnect_schedules_exactly_one_reconnect() {
    let mut h = connected_call().await;

    h.transport.drop_connection("network lost");
    wait_for_event(&mut h.events, |e| {
        matches!(e, CallEvent::StateChanged { state: CallState::Reconnecting })
    })
    .await;

    wait_until(|| h.transport.connects().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.connects().len(), 2);

    h.transport.open();
    wait_for_event(&mut h.events, |e| {
        matches!(e, CallEvent::StateChanged { state: CallState::Connected })
    })
    .await;

    let snapshot = h.call.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Connected);
    assert_eq!(snapshot.reconnect_attempts, 0);

    // Aufnahme läuft im neuen Segment weiter
    wait_until(|| h.mic.opens() == 2).await;

    let summary = h.call.hang_up().await.unwrap();
    assert_eq!(summary.reconnects, 1);
}

#[tokio::test]
async fn test_reconnect_budget_ends_call() {
    let mut h = connected_call().await;

    h.transport.fail_connects.store(true, Ordering::SeqCst);
    h.transport.drop_connection("network lost");

    let failure = wait_for_event(&mut h.events, |e| matches!(e, CallEvent::Failure(_))).await;
    assert!(matches!(failure, CallEvent::Failure(CallFailure::ConnectionLost)));

    let ended = wait_for_event(&mut h.events, |e| matches!(e, CallEvent::Ended(_))).await;
    match ended {
        CallEvent::Ended(summary) => {
            assert_eq!(summary.end_reason, EndReason::ReconnectBudgetExceeded)
        }
        _ => unreachable!(),
    }

    // 1 initialer Aufbau + 3 Versuche, danach nichts mehr
    assert_eq!(h.transport.connects().len(), 4);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.connects().len(), 4);

    assert!(h.call.hang_up().await.is_none());
}

#[tokio::test]
async fn test_mute_stops_capture() {
    let h = connected_call().await;
    wait_until(|| h.mic.opens() == 1).await;

    h.mic.push(frame(1));
    wait_until(|| h.transport.sent().len() == 1).await;

    h.call.set_muted(true).await.unwrap();
    wait_until(|| count_messages(&h.transport.sent()) == (1, 1)).await;

    // Frames die jetzt noch vom Gerät kämen, gehen nirgendwo hin
    h.mic.push(frame(2));
    h.mic.push(frame(3));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.sent().len(), 2);
    assert_eq!(h.mic.opens(), 1);

    let snapshot = h.call.snapshot().await.unwrap();
    assert!(snapshot.mic_muted);

    // Aufheben startet ein neues Segment
    h.call.set_muted(false).await.unwrap();
    assert_eq!(h.mic.opens(), 2);
}

#[tokio::test]
async fn test_mute_sends_frames_already_captured() {
    for _ in 0..10 {
        let h = connected_call().await;
        wait_until(|| h.mic.opens() == 1).await;

        // Der Capture-Thread liest die Frames, während der Actor nicht läuft
        h.mic.push(frame(1));
        h.mic.push(frame(2));
        h.mic.push(frame(3));
        std::thread::sleep(Duration::from_millis(100));

        h.call.set_muted(true).await.unwrap();
        wait_until(|| count_messages(&h.transport.sent()) == (3, 1)).await;

        let sent = h.transport.sent();
        assert_eq!(sent_markers(&sent), vec![1, 2, 3]);
        assert!(sent.last().unwrap().is_end_of_stream());

        h.call.hang_up().await;
    }
}

#[tokio::test]
async fn test_hang_up_sends_frames_already_captured() {
    for _ in 0..10 {
        let h = connected_call().await;
        wait_until(|| h.mic.opens() == 1).await;

        h.mic.push(frame(1));
        h.mic.push(frame(2));
        h.mic.push(frame(3));
        std::thread::sleep(Duration::from_millis(100));

        h.call.hang_up().await.unwrap();

        // Flush vor dem Schließen: alles ist bereits übergeben
        let sent = h.transport.sent();
        assert_eq!(count_messages(&sent), (3, 1));
        assert_eq!(sent_markers(&sent), vec![1, 2, 3]);
        assert!(sent.last().unwrap().is_end_of_stream());
    }
}

#[tokio::test]
async fn test_muted_call_does_not_start_capture_on_connect() {
    let mut h = start_call(FakeMic::new());
    h.call.set_muted(true).await.unwrap();

    h.transport.open();
    wait_for_event(&mut h.events, |e| {
        matches!(e, CallEvent::StateChanged { state: CallState::Connected })
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.mic.opens(), 0);
}

#[tokio::test]
async fn test_recording_commands() {
    let h = start_call(FakeMic::new());
    assert!(matches!(h.call.start_recording().await, Err(CallError::NotConnected)));

    h.transport.open();
    wait_until(|| h.mic.opens() == 1).await;
    assert!(matches!(h.call.start_recording().await, Err(CallError::AlreadyRecording)));

    h.call.stop_recording().await.unwrap();
    h.call.stop_recording().await.unwrap();
    wait_until(|| count_messages(&h.transport.sent()) == (0, 1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count_messages(&h.transport.sent()), (0, 1));

    h.call.start_recording().await.unwrap();
    assert_eq!(h.mic.opens(), 2);
}

#[tokio::test]
async fn test_microphone_failure_keeps_call_alive() {
    let mic = FakeMic::new();
    mic.fail_open.store(true, Ordering::SeqCst);
    let mut h = start_call(mic);

    h.transport.open();
    let failure = wait_for_event(&mut h.events, |e| matches!(e, CallEvent::Failure(_))).await;
    assert!(matches!(failure, CallEvent::Failure(CallFailure::MicrophoneUnavailable)));

    let snapshot = h.call.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Connected);

    assert!(matches!(h.call.set_muted(true).await, Ok(())));
    assert!(matches!(h.call.set_muted(false).await, Err(CallError::Capture(_))));
    assert!(h.call.snapshot().await.unwrap().mic_muted);
}

#[tokio::test]
async fn test_speaker_off_discards_received_audio() {
    let mut h = connected_call().await;

    h.call.set_speaker(false).await.unwrap();
    h.transport.deliver(audio_update(5));

    let message = wait_for_event(&mut h.events, |e| matches!(e, CallEvent::Message { .. })).await;
    assert!(matches!(
        message,
        CallEvent::Message { audio: Some(_), .. }
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.speaker.speaker.played.lock().is_empty());

    h.call.set_speaker(true).await.unwrap();
    h.transport.deliver(audio_update(6));
    wait_until(|| h.speaker.speaker.played_markers() == vec![6]).await;
}

#[tokio::test]
async fn test_received_audio_plays_in_order_without_overlap() {
    let h = connected_call().await;

    for marker in 1..=20 {
        h.transport.deliver(audio_update(marker));
    }

    wait_until(|| h.speaker.speaker.played.lock().len() == 20).await;
    assert_eq!(h.speaker.speaker.played_markers(), (1..=20).collect::<Vec<_>>());
    assert_eq!(h.speaker.speaker.overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_text_updates_end_up_in_transcript() {
    let mut h = connected_call().await;

    h.transport.deliver(ServerUpdate {
        text: Some("오늘 하루는 어땠어요?".to_string()),
        audio: None,
    });
    let message = wait_for_event(&mut h.events, |e| matches!(e, CallEvent::Message { .. })).await;
    assert!(matches!(message, CallEvent::Message { text: Some(_), audio: None }));

    let summary = h.call.hang_up().await.unwrap();
    assert_eq!(summary.transcript.len(), 1);
    assert_eq!(summary.transcript[0].text, "오늘 하루는 어땠어요?");
}

#[tokio::test]
async fn test_elapsed_ticks() {
    let mut h = connected_call().await;

    let elapsed = wait_for_event(&mut h.events, |e| matches!(e, CallEvent::Elapsed { .. })).await;
    assert!(matches!(elapsed, CallEvent::Elapsed { seconds: 1 }));
}

#[tokio::test]
async fn test_dropping_all_handles_hangs_up() {
    let mut h = connected_call().await;
    drop(h.call);

    wait_for_event(&mut h.events, |e| matches!(e, CallEvent::Ended(_))).await;
    assert_eq!(h.transport.closes(), 1);
}
