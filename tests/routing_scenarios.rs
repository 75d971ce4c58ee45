//! End-to-end routing scenarios against the in-memory device stack

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use echo_midi::device::mock::MockSubsystem;
use echo_midi::echo::SendFailure;
use echo_midi::focus::mock::ChannelFocusSource;
use echo_midi::focus::FocusRegistry;
use echo_midi::persistence::RoutingDocument;
use echo_midi::{EchoContext, Registry};

const NOTE_ON: [u8; 3] = [0x90, 0x3C, 0x64];
const SYSEX: [u8; 6] = [0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7];
const REAPER: &str = r"C:\Program Files\REAPER (x64)\reaper.exe";
const NOTEPAD: &str = r"C:\Windows\System32\notepad.exe";

fn registry(mock: &MockSubsystem) -> Registry {
    Registry::new(Arc::new(mock.clone()), FocusRegistry::new())
}

/// A unit is open exactly while its input is available with echo enabled,
/// every attached target belongs to an available output with a mute record,
/// and the live user mute matches that record.
fn assert_invariants(reg: &Registry, mock: &MockSubsystem) {
    let outputs = reg.outputs();
    for input in reg.inputs() {
        assert_eq!(
            mock.input_open(&input.name),
            input.available && input.echo_enabled,
            "open state of '{}'",
            input.name
        );
        assert_eq!(input.echoing, input.available && input.echo_enabled);
        for target in &input.targets {
            let owner = outputs
                .iter()
                .find(|o| o.id == Some(*target))
                .unwrap_or_else(|| panic!("target {} of '{}' has no output", target, input.name));
            assert!(owner.available);
            assert!(owner.mute.contains_key(&input.name));
            let state = reg.target_state(&owner.name, &input.name).unwrap();
            assert_eq!(state.user_muted, reg.is_muted(&owner.name, &input.name));
        }
    }
}

#[test]
fn test_echo_forwards_to_unmuted_targets_only() {
    let mock = MockSubsystem::with_devices(&["Keys"], &["Port A", "Port B"]);
    let mut reg = registry(&mock);
    reg.reconcile();

    reg.set_echo("Keys", true).unwrap();
    reg.set_target_mute("Port A", "Keys", false).unwrap();
    reg.set_target_mute("Port B", "Keys", true).unwrap();
    assert_invariants(&reg, &mock);

    assert!(mock.inject("Keys", &NOTE_ON));
    assert!(mock.inject("Keys", &SYSEX));

    let sent = mock.sent("Port A");
    assert_eq!(sent.len(), 2);
    assert!(!sent[0].long);
    assert_eq!(sent[0].data, NOTE_ON);
    assert!(sent[1].long);
    assert_eq!(sent[1].data, SYSEX);
    assert!(mock.sent("Port B").is_empty());
}

#[test]
fn test_new_output_stays_muted_until_unmuted() {
    let mock = MockSubsystem::with_devices(&["Keys"], &[]);
    let mut reg = registry(&mock);
    reg.reconcile();
    reg.set_echo("Keys", true).unwrap();

    mock.plug_output("Port A");
    let report = reg.reconcile();
    assert_eq!(report.outputs_added, vec!["Port A"]);
    assert_eq!(report.attached, 0);
    assert!(reg.is_muted("Port A", "Keys"));
    assert!(!reg.sends("Port A", "Keys"));

    mock.inject("Keys", &NOTE_ON);
    assert!(mock.sent("Port A").is_empty());
    assert_eq!(mock.output_open_count("Port A"), 0);
    assert_invariants(&reg, &mock);
}

#[test]
fn test_mutators_are_idempotent() {
    let mock = MockSubsystem::with_devices(&["Keys"], &["Port A"]);
    let mut reg = registry(&mock);
    reg.reconcile();

    for _ in 0..3 {
        reg.set_echo("Keys", true).unwrap();
        reg.set_target_mute("Port A", "Keys", false).unwrap();
        assert_invariants(&reg, &mock);
    }
    assert_eq!(mock.output_open_count("Port A"), 1);
    assert_eq!(reg.input("Keys").unwrap().targets.len(), 1);

    mock.inject("Keys", &NOTE_ON);
    assert_eq!(mock.sent_data("Port A"), vec![NOTE_ON.to_vec()]);
}

#[test]
fn test_input_reconnect_restores_echo_and_targets() {
    let mock = MockSubsystem::with_devices(&["Keys"], &["Port A"]);
    let mut reg = registry(&mock);
    reg.reconcile();
    reg.set_echo("Keys", true).unwrap();
    reg.set_target_mute("Port A", "Keys", false).unwrap();

    mock.unplug_input("Keys");
    let report = reg.reconcile();
    assert_eq!(report.inputs_lost, vec!["Keys"]);
    let keys = reg.input("Keys").unwrap();
    assert!(!keys.available);
    assert!(keys.echo_enabled, "configuration survives the unplug");
    assert!(!keys.echoing);
    assert!(keys.targets.is_empty());
    assert_eq!(mock.output_open_count("Port A"), 0);
    assert!(!reg.is_muted("Port A", "Keys"));
    assert_invariants(&reg, &mock);

    mock.plug_input("Keys");
    let report = reg.reconcile();
    assert_eq!(report.inputs_returned, vec!["Keys"]);
    assert_eq!(report.attached, 1);
    assert!(mock.input_running("Keys"));
    assert!(reg.sends("Port A", "Keys"));
    assert_invariants(&reg, &mock);

    mock.inject("Keys", &NOTE_ON);
    assert_eq!(mock.sent_data("Port A"), vec![NOTE_ON.to_vec()]);
}

#[test]
fn test_output_reconnect_under_shifted_id() {
    let mock = MockSubsystem::with_devices(&["Keys"], &["Port A", "Port B"]);
    let mut reg = registry(&mock);
    reg.reconcile();
    reg.set_echo("Keys", true).unwrap();
    reg.set_target_mute("Port B", "Keys", false).unwrap();
    assert_eq!(reg.output("Port B").unwrap().id, Some(1));

    // Port B slides down to id 0 once Port A is gone
    mock.unplug_output("Port A");
    let report = reg.reconcile();
    assert_eq!(report.outputs_lost, vec!["Port A"]);
    assert_eq!(reg.output("Port B").unwrap().id, Some(0));
    assert_eq!(reg.input("Keys").unwrap().targets, vec![0]);
    assert_invariants(&reg, &mock);

    mock.inject("Keys", &NOTE_ON);
    assert_eq!(mock.sent_data("Port B"), vec![NOTE_ON.to_vec()]);
    assert!(mock.sent("Port A").is_empty());
}

#[test]
fn test_partial_fan_out_failure_is_reported_once() {
    let mock = MockSubsystem::with_devices(&["Keys"], &["Port A", "Port B"]);
    let failures = Arc::new(AtomicUsize::new(0));
    let mut reg = registry(&mock);
    {
        let failures = failures.clone();
        reg.set_send_failure_callback(Arc::new(move |failure: &SendFailure| {
            assert_eq!(failure.unit, "Keys");
            failures.fetch_add(1, Ordering::SeqCst);
        }));
    }
    reg.reconcile();
    reg.set_echo("Keys", true).unwrap();
    reg.set_target_mute("Port A", "Keys", false).unwrap();
    reg.set_target_mute("Port B", "Keys", false).unwrap();

    mock.fail_sends("Port A", true);
    assert!(mock.inject("Keys", &NOTE_ON));

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(mock.sent("Port A").is_empty());
    assert_eq!(mock.sent_data("Port B"), vec![NOTE_ON.to_vec()]);

    // A failed send does not detach the target
    mock.fail_sends("Port A", false);
    mock.inject("Keys", &NOTE_ON);
    assert_eq!(mock.sent("Port A").len(), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[test]
fn test_focus_mute_follows_foreground_application() {
    let mock = MockSubsystem::with_devices(&["Keys"], &["Port A", "Port B"]);
    let mut ctx = EchoContext::new(Arc::new(mock.clone()));
    let (source, injector) = ChannelFocusSource::new();
    ctx.init(Some(Box::new(source))).unwrap();

    let mut reg = ctx.registry();
    reg.reconcile();
    reg.set_echo("Keys", true).unwrap();
    reg.set_target_mute("Port A", "Keys", false).unwrap();
    reg.set_target_mute("Port B", "Keys", false).unwrap();
    reg.set_target_focus_rule("Port A", "Keys", "reaper").unwrap();

    // No foreground seen yet: the rule does not mute
    assert!(reg.sends("Port A", "Keys"));

    injector.focus(REAPER);
    injector.wait_for(ctx.focus(), 1);
    let state = reg.target_state("Port A", "Keys").unwrap();
    assert!(!state.focus_muted);

    injector.focus(NOTEPAD);
    injector.wait_for(ctx.focus(), 2);
    let state = reg.target_state("Port A", "Keys").unwrap();
    assert!(state.focus_muted);
    assert!(!state.user_muted);
    assert!(!reg.is_muted("Port A", "Keys"));

    mock.inject("Keys", &NOTE_ON);
    assert!(mock.sent("Port A").is_empty());
    assert_eq!(mock.sent_data("Port B"), vec![NOTE_ON.to_vec()]);

    // Clearing the rule lifts the focus mute straight away
    reg.set_target_focus_rule("Port A", "Keys", "").unwrap();
    assert!(reg.sends("Port A", "Keys"));

    drop(reg);
    ctx.shutdown();
    assert!(injector.is_stopped());
}

#[test]
fn test_focus_rule_applies_to_reattached_target() {
    let mock = MockSubsystem::with_devices(&["Keys"], &["Port A"]);
    let mut ctx = EchoContext::new(Arc::new(mock.clone()));
    let (source, injector) = ChannelFocusSource::new();
    ctx.init(Some(Box::new(source))).unwrap();

    let mut reg = ctx.registry();
    reg.reconcile();
    reg.set_echo("Keys", true).unwrap();
    reg.set_target_mute("Port A", "Keys", false).unwrap();
    reg.set_target_focus_rule("Port A", "Keys", "reaper.exe").unwrap();

    injector.focus(NOTEPAD);
    injector.wait_for(ctx.focus(), 1);
    assert!(!reg.sends("Port A", "Keys"));

    mock.unplug_output("Port A");
    reg.reconcile();
    mock.plug_output("Port A");
    reg.reconcile();

    // The fresh target picks the rule up against the current foreground
    let state = reg.target_state("Port A", "Keys").unwrap();
    assert_eq!(state.focus_mute_rule, "reaper.exe");
    assert!(state.focus_muted);
    assert_invariants(&reg, &mock);
}

#[test]
fn test_invariants_hold_across_a_session() {
    let mock = MockSubsystem::with_devices(&["Keys", "Pads"], &["Port A", "Port B"]);
    let mut reg = registry(&mock);

    reg.reconcile();
    assert_invariants(&reg, &mock);
    reg.set_echo("Keys", true).unwrap();
    reg.set_target_mute("Port A", "Keys", false).unwrap();
    assert_invariants(&reg, &mock);
    // Targets attach to a unit that is not echoing yet
    reg.set_target_mute("Port B", "Pads", false).unwrap();
    assert_invariants(&reg, &mock);
    reg.set_echo("Pads", true).unwrap();
    assert_invariants(&reg, &mock);

    mock.unplug_output("Port A");
    reg.reconcile();
    assert_invariants(&reg, &mock);
    mock.unplug_input("Keys");
    reg.reconcile();
    assert_invariants(&reg, &mock);

    reg.set_target_mute("Port A", "Pads", false).unwrap();
    assert_invariants(&reg, &mock);

    mock.plug_output("Port A");
    mock.plug_input("Keys");
    reg.reconcile();
    assert_invariants(&reg, &mock);
    reg.set_echo("Pads", false).unwrap();
    assert_invariants(&reg, &mock);
    reg.set_target_mute("Port B", "Pads", true).unwrap();
    assert_invariants(&reg, &mock);

    assert!(reg.sends("Port A", "Keys"));
    assert_eq!(reg.input("Pads").unwrap().targets.len(), 2);
    assert!(!reg.sends("Port B", "Pads"));

    reg.shutdown();
    assert!(!mock.input_open("Keys"));
    assert!(!mock.input_open("Pads"));
    assert_eq!(mock.output_open_count("Port A"), 0);
    assert_eq!(mock.output_open_count("Port B"), 0);
}

#[tokio::test]
async fn test_routing_survives_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("routing.json");

    let mock = MockSubsystem::with_devices(&["Keys", "Pads"], &["Port A", "Port B"]);
    let mut reg = registry(&mock);
    reg.reconcile();
    reg.set_echo("Keys", true).unwrap();
    reg.set_target_mute("Port A", "Keys", false).unwrap();
    reg.set_target_mute("Port B", "Keys", true).unwrap();
    reg.set_target_focus_rule("Port A", "Keys", "reaper").unwrap();
    reg.set_target_mute("Port B", "Pads", false).unwrap();
    // Configured before the device ever appeared
    reg.set_echo("Drums", true).unwrap();
    reg.set_target_mute("Port A", "Drums", false).unwrap();

    let expected = reg.routing_state();
    RoutingDocument::from_registry(&reg).save_to_file(&path).await.unwrap();
    reg.shutdown();

    let fresh_mock = MockSubsystem::with_devices(&["Pads", "Keys"], &["Port B", "Port A"]);
    let mut fresh = registry(&fresh_mock);
    fresh.reconcile();
    let document = RoutingDocument::load_from_file(&path).await.unwrap();
    assert!(document.apply_to(&mut fresh).is_empty());

    assert_eq!(fresh.routing_state(), expected);
    assert!(fresh_mock.input_running("Keys"));
    assert!(!fresh_mock.input_open("Pads"));
    assert!(fresh.sends("Port A", "Keys"));
    assert!(fresh.sends("Port B", "Pads"));
    assert!(!fresh.sends("Port B", "Keys"));
    assert_invariants(&fresh, &fresh_mock);
}
