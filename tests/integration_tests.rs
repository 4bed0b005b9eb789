//! Integration tests of the transfer pipelines.
//!
//! Every test runs against a throw-away [`Gateway`]: transfers go through the
//! loopback protocol, or through a [`ServerPipeline`] driven by the test.

use ferry_core::{
    TransferColumn, TransferContext, TransferErrorCode, TransferStatus, TransferStep, TransferStore,
};
use ferry_integration_tests::{
    Gateway, GatewayOptions, RecordingPartner, counting_hook, counting_task,
};
use ferry_pipeline::{
    ClientPipeline, DEFAULT_HANDLER_TIMEOUT, FnTask, Pipeline, PipelineState, Protocols, ServerPipeline, StopSignal, Task,
    TaskChains, TaskError, Trace,
};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

const CONTENT: &[u8] = b"the quick brown fox jumps over it!!";
const DEADLINE: Duration = DEFAULT_HANDLER_TIMEOUT;

// ============================================================================
// Nominal transfers
// ============================================================================

#[test]
fn test_push_through_loopback() {
    assert_eq!(CONTENT.len(), 35);
    let gw = Gateway::new(true);
    let trans = gw.planned_client(CONTENT);

    let cp = ClientPipeline::new(&gw.services, trans.clone()).unwrap();
    assert_eq!(gw.slots_taken(), (0, 1));
    cp.run().unwrap();

    let entry = gw.store.get_history(trans.id).unwrap();
    assert_eq!(entry.status, TransferStatus::Done);
    assert_eq!(entry.progress, 35);
    assert_eq!(entry.filesize, Some(35));
    assert_eq!(
        fs::read(gw.partner_dir().join(&trans.src_filename)).unwrap(),
        CONTENT
    );
    assert!(gw.store.get_transfer(trans.id).is_err());
    assert_eq!(gw.slots_taken(), (0, 0));
    assert!(gw.services.registry.is_empty());
}

#[test]
fn test_pull_through_loopback() {
    let gw = Gateway::new(false);
    let trans = gw.planned_client(b"");
    fs::write(gw.partner_dir().join(&trans.src_filename), CONTENT).unwrap();

    let cp = ClientPipeline::new(&gw.services, trans.clone()).unwrap();
    assert_eq!(gw.slots_taken(), (1, 0));
    cp.run().unwrap();

    let entry = gw.store.get_history(trans.id).unwrap();
    assert_eq!(entry.status, TransferStatus::Done);
    assert_eq!(fs::read(&entry.local_path).unwrap(), CONTENT);
    assert!(!entry.local_path.to_string_lossy().ends_with(".part"));
    assert_eq!(gw.slots_taken(), (0, 0));
}

#[test]
fn test_server_upload_out_of_order() {
    let gw = Gateway::new(false);
    let partner = Arc::new(RecordingPartner::default());
    let sp = ServerPipeline::new(&gw.services, gw.server_transfer("upload.bin"), partner.clone())
        .unwrap();

    let file = sp.start().unwrap();
    file.write_at(&CONTENT[20..], 20).unwrap();
    file.write_at(&CONTENT[..20], 0).unwrap();
    sp.close().unwrap();

    let entry = gw.store.get_history(sp.pipeline().transfer_id()).unwrap();
    assert_eq!(entry.status, TransferStatus::Done);
    assert!(entry.is_server);
    assert_eq!(fs::read(&entry.local_path).unwrap(), CONTENT);
    assert!(partner.received().is_empty());
    assert_eq!(gw.slots_taken(), (0, 0));
}

// ============================================================================
// Limits
// ============================================================================

#[test]
fn test_slot_limit_leaves_transfer_untouched() {
    let gw = Gateway::with_options(GatewayOptions {
        is_send: true,
        max_outgoing: 1,
        ..GatewayOptions::default()
    });
    let first = gw.planned_client(CONTENT);
    let second = gw.planned_client(CONTENT);

    let running = ClientPipeline::new(&gw.services, first).unwrap();
    let err = ClientPipeline::new(&gw.services, second.clone()).err().unwrap();

    assert_eq!(err.code(), TransferErrorCode::ExceededLimit);
    assert_eq!(gw.store.get_transfer(second.id).unwrap(), second);
    assert_eq!(gw.slots_taken(), (0, 1));
    assert_eq!(gw.services.registry.len(), 1);

    running.run().unwrap();
    assert_eq!(gw.slots_taken(), (0, 0));
    ClientPipeline::new(&gw.services, second).unwrap().run().unwrap();
}

#[test]
fn test_directions_have_separate_limits() {
    let gw = Gateway::with_options(GatewayOptions {
        is_send: false,
        max_incoming: 1,
        ..GatewayOptions::default()
    });

    let _download = Pipeline::new_client(&gw.services, gw.planned_client(b"")).unwrap();
    let err = Pipeline::new_client(&gw.services, gw.planned_client(b"")).err().unwrap();
    assert_eq!(err.code(), TransferErrorCode::ExceededLimit);
    assert_eq!(gw.services.limits.outbound.available(), None);
}

#[test]
fn test_setup_failure_releases_slot() {
    let gw = Gateway::new(true);
    let services = gw.services.clone().with_protocols(Protocols::new());
    let trans = gw.planned_client(CONTENT);

    let err = ClientPipeline::new(&services, trans.clone()).err().unwrap();

    assert_eq!(err.code(), TransferErrorCode::Internal);
    assert_eq!(
        gw.store.get_transfer(trans.id).unwrap().status,
        TransferStatus::Error
    );
    assert_eq!(gw.slots_taken(), (0, 0));
    assert!(gw.services.registry.is_empty());
}

// ============================================================================
// Task chains
// ============================================================================

#[test]
fn test_pre_task_failure_runs_error_tasks() {
    let error_runs = Arc::new(AtomicU32::new(0));
    let failing: Arc<dyn Task> = Arc::new(FnTask::new(
        "reject",
        |_: &TransferContext, _: &StopSignal| Err(TaskError::new("file rejected")),
    ));
    let gw = Gateway::with_options(GatewayOptions {
        is_send: true,
        chains: TaskChains {
            pre: vec![failing],
            error: vec![counting_task("report", &error_runs)],
            ..TaskChains::default()
        },
        ..GatewayOptions::default()
    });
    let trans = gw.planned_client(CONTENT);

    let err = ClientPipeline::new(&gw.services, trans.clone())
        .unwrap()
        .run()
        .unwrap_err();

    assert_eq!(err.code(), TransferErrorCode::ExternalOperation);
    assert_eq!(error_runs.load(Ordering::SeqCst), 1);
    let stored = gw.store.get_transfer(trans.id).unwrap();
    assert_eq!(stored.status, TransferStatus::Error);
    assert_eq!(stored.step, TransferStep::PreTasks);
    assert_eq!(stored.error.code, TransferErrorCode::ExternalOperation);
    assert!(!gw.partner_dir().join(&trans.src_filename).exists());
    assert_eq!(gw.slots_taken(), (0, 0));
}

#[test]
fn test_post_tasks_see_final_path() {
    let seen = Arc::new(std::sync::Mutex::new(None));
    let record: Arc<dyn Task> = {
        let seen = Arc::clone(&seen);
        Arc::new(FnTask::new(
            "record",
            move |ctx: &TransferContext, _: &StopSignal| {
                *seen.lock().unwrap() = Some(ctx.transfer().local_path.clone());
                Ok(())
            },
        ))
    };
    let gw = Gateway::with_options(GatewayOptions {
        is_send: false,
        chains: TaskChains {
            post: vec![record],
            ..TaskChains::default()
        },
        ..GatewayOptions::default()
    });
    let trans = gw.planned_client(b"");
    fs::write(gw.partner_dir().join(&trans.src_filename), CONTENT).unwrap();

    ClientPipeline::new(&gw.services, trans.clone())
        .unwrap()
        .run()
        .unwrap();

    let entry = gw.store.get_history(trans.id).unwrap();
    assert_eq!(seen.lock().unwrap().as_ref(), Some(&entry.local_path));
}

// ============================================================================
// Control plane
// ============================================================================

/// Pre-task blocking on its stop signal the first time it runs
fn blocking_task(started: mpsc::Sender<()>) -> Arc<dyn Task> {
    let first = AtomicBool::new(true);
    let started = std::sync::Mutex::new(started);
    Arc::new(FnTask::new(
        "wait",
        move |_: &TransferContext, stop: &StopSignal| {
            if first.swap(false, Ordering::SeqCst) {
                let _ = started.lock().unwrap().send(());
                stop.wait_timeout(Duration::from_secs(10));
            }
            Ok(())
        },
    ))
}

#[test]
fn test_pause_during_pre_tasks_then_resume() {
    let (tx, rx) = mpsc::channel();
    let gw = Gateway::with_options(GatewayOptions {
        is_send: true,
        chains: TaskChains {
            pre: vec![blocking_task(tx)],
            ..TaskChains::default()
        },
        ..GatewayOptions::default()
    });
    let trans = gw.planned_client(CONTENT);
    let cp = Arc::new(ClientPipeline::new(&gw.services, trans.clone()).unwrap());

    let worker = {
        let cp = Arc::clone(&cp);
        thread::spawn(move || cp.run())
    };
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    gw.services.registry.pause(trans.id, DEADLINE).unwrap();

    let err = worker.join().unwrap().unwrap_err();
    assert_eq!(err.code(), TransferErrorCode::Stopped);
    let paused = gw.store.get_transfer(trans.id).unwrap();
    assert_eq!(paused.status, TransferStatus::Paused);
    assert_eq!(paused.next_retry, None);
    assert_eq!(gw.slots_taken(), (0, 0));
    assert!(!gw.services.registry.exists(trans.id));

    ClientPipeline::new(&gw.services, paused).unwrap().run().unwrap();
    assert_eq!(
        gw.store.get_history(trans.id).unwrap().status,
        TransferStatus::Done
    );
}

#[test]
fn test_resume_after_interruption_keeps_partial_data() {
    let gw = Gateway::new(false);
    let trans = gw.planned_client(b"");
    fs::write(gw.partner_dir().join(&trans.src_filename), CONTENT).unwrap();

    // first attempt stops after ten bytes
    let pipeline = Pipeline::new_client(&gw.services, trans.clone()).unwrap();
    pipeline.pre_tasks().unwrap();
    let file = pipeline.start_data().unwrap();
    file.write_at(&CONTENT[..10], 0).unwrap();
    pipeline.interrupt(DEADLINE).unwrap();

    let interrupted = gw.store.get_transfer(trans.id).unwrap();
    assert_eq!(interrupted.status, TransferStatus::Interrupted);
    assert_eq!(interrupted.step, TransferStep::Data);
    assert_eq!(interrupted.progress, 10);

    ClientPipeline::new(&gw.services, interrupted)
        .unwrap()
        .run()
        .unwrap();

    let entry = gw.store.get_history(trans.id).unwrap();
    assert_eq!(entry.progress, 35);
    assert_eq!(fs::read(&entry.local_path).unwrap(), CONTENT);
}

#[test]
fn test_transfer_stopped_during_error_tasks_is_not_completed() {
    let gw = Gateway::new(true);
    let mut trans = gw.planned_client(CONTENT);
    trans.status = TransferStatus::Interrupted;
    trans.step = TransferStep::ErrorTasks;
    gw.store
        .update_transfer(&trans, &[TransferColumn::Status, TransferColumn::Step])
        .unwrap();

    let stored = gw.store.get_transfer(trans.id).unwrap();
    assert!(ClientPipeline::new(&gw.services, stored).is_err());

    assert!(!gw.partner_dir().join(&trans.src_filename).exists());
    assert!(gw.store.get_history(trans.id).is_err());
    let stored = gw.store.get_transfer(trans.id).unwrap();
    assert_eq!(stored.status, TransferStatus::Error);
    assert_eq!(stored.progress, 0);
    assert_eq!(gw.slots_taken(), (0, 0));
}

#[test]
fn test_failed_pre_tasks_resume_from_their_checkpoint() {
    let gw = Gateway::with_options(GatewayOptions {
        is_send: true,
        chains: TaskChains {
            pre: vec![Arc::new(FnTask::new(
                "refuse-once",
                |ctx: &TransferContext, _: &StopSignal| {
                    if ctx.transfer().remaining_tries > 0 {
                        Err(TaskError::new("not yet"))
                    } else {
                        Ok(())
                    }
                },
            ))],
            ..TaskChains::default()
        },
        ..GatewayOptions::default()
    });
    let mut trans = gw.planned_client(CONTENT);
    trans.remaining_tries = 1;
    gw.store
        .update_transfer(&trans, &[TransferColumn::Retry])
        .unwrap();

    let first = ClientPipeline::new(&gw.services, gw.store.get_transfer(trans.id).unwrap()).unwrap();
    assert!(first.run().is_err());
    let failed = gw.store.get_transfer(trans.id).unwrap();
    assert_eq!(failed.status, TransferStatus::Error);
    assert_eq!(failed.step, TransferStep::PreTasks);

    let mut retry = failed;
    retry.remaining_tries = 0;
    ClientPipeline::new(&gw.services, retry).unwrap().run().unwrap();

    let entry = gw.store.get_history(trans.id).unwrap();
    assert_eq!(entry.status, TransferStatus::Done);
    assert_eq!(entry.progress, 35);
    assert_eq!(
        fs::read(gw.partner_dir().join(&trans.src_filename)).unwrap(),
        CONTENT
    );
}

#[test]
fn test_concurrent_requests_end_transfer_once() {
    let ends = Arc::new(AtomicU32::new(0));
    let gw = Gateway::with_options(GatewayOptions {
        is_send: false,
        trace: Trace {
            on_transfer_end: Some(counting_hook(&ends)),
            ..Trace::default()
        },
        ..GatewayOptions::default()
    });
    let partner = Arc::new(RecordingPartner::default());
    let sp = ServerPipeline::new(&gw.services, gw.server_transfer("race.bin"), partner.clone())
        .unwrap();
    let file = sp.start().unwrap();
    file.write(&CONTENT[..5]).unwrap();

    let pipeline = Arc::clone(sp.pipeline());
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                match i {
                    0 => {
                        let _ = pipeline.pause(DEADLINE);
                    }
                    1 => {
                        let _ = pipeline.interrupt(DEADLINE);
                    }
                    2 => {
                        let _ = pipeline.cancel(DEADLINE);
                    }
                    _ => pipeline.set_error(TransferErrorCode::ConnectionReset, "connection lost"),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ends.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.state(), PipelineState::InError);
    assert!(partner.received().len() <= 1);
    assert_eq!(gw.slots_taken(), (0, 0));
    assert!(gw.services.registry.is_empty());
    assert!(sp.close().is_err());
}

#[test]
fn test_failure_races_settle_on_one_outcome() {
    let error_tasks = Arc::new(AtomicU32::new(0));
    let gw = Gateway::with_options(GatewayOptions {
        is_send: false,
        chains: TaskChains {
            error: vec![counting_task("on-error", &error_tasks)],
            ..TaskChains::default()
        },
        ..GatewayOptions::default()
    });

    for round in 0..50 {
        let before = error_tasks.load(Ordering::SeqCst);
        let partner = Arc::new(RecordingPartner::default());
        let sp = ServerPipeline::new(
            &gw.services,
            gw.server_transfer(&format!("race-{round}.bin")),
            partner.clone(),
        )
        .unwrap();
        let file = sp.start().unwrap();
        file.write(&CONTENT[..8]).unwrap();

        let pipeline = Arc::clone(sp.pipeline());
        let barrier = Arc::new(Barrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let pipeline = Arc::clone(&pipeline);
                let file = Arc::clone(&file);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    match i {
                        0 => pipeline.set_error(TransferErrorCode::ConnectionReset, "link lost"),
                        1 => {
                            let _ = pipeline.pause(DEADLINE);
                        }
                        _ => {
                            let _ = file.check_hash(&[0u8; 32]);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pipeline.has_ended(), "round {round}");
        assert!(partner.received().len() <= 1, "round {round}");
        let ran = error_tasks.load(Ordering::SeqCst) - before;
        let outcome = pipeline.stored_error().unwrap();
        let trans = gw.store.get_transfer(pipeline.transfer_id()).unwrap();
        if outcome.code() == TransferErrorCode::Stopped {
            assert_eq!(trans.status, TransferStatus::Paused, "round {round}");
            assert_eq!(ran, 0, "round {round}");
        } else {
            assert_eq!(trans.status, TransferStatus::Error, "round {round}");
            assert_eq!(trans.error.code, outcome.code(), "round {round}");
            assert_eq!(ran, 1, "round {round}");
        }
    }

    assert_eq!(gw.slots_taken(), (0, 0));
    assert!(gw.services.registry.is_empty());
}

#[test]
fn test_stop_all_from_client() {
    let gw = Gateway::new(true);
    let pipelines: Vec<_> = (0..3)
        .map(|_| Pipeline::new_client(&gw.services, gw.planned_client(CONTENT)).unwrap())
        .collect();
    assert_eq!(gw.services.registry.len(), 3);
    assert_eq!(gw.slots_taken(), (0, 3));

    gw.services.registry.stop_all_from_client(gw.client_id, DEADLINE).unwrap();

    for pipeline in &pipelines {
        let trans = gw.store.get_transfer(pipeline.transfer_id()).unwrap();
        assert_eq!(trans.status, TransferStatus::Interrupted);
        assert!(pipeline.has_ended());
    }
    assert!(gw.services.registry.is_empty());
    assert_eq!(gw.slots_taken(), (0, 0));
}

#[test]
fn test_cancel_all_archives() {
    let gw = Gateway::new(true);
    let client = Pipeline::new_client(&gw.services, gw.planned_client(CONTENT)).unwrap();
    let partner = Arc::new(RecordingPartner::default());
    let server = ServerPipeline::new(&gw.services, gw.server_transfer("out.txt"), partner.clone())
        .unwrap();

    gw.services.registry.cancel_all(DEADLINE).unwrap();

    for id in [client.transfer_id(), server.pipeline().transfer_id()] {
        assert_eq!(
            gw.store.get_history(id).unwrap().status,
            TransferStatus::Cancelled
        );
    }
    assert_eq!(
        partner.received(),
        vec![(
            TransferErrorCode::Canceled,
            "transfer canceled by user".to_string()
        )]
    );
    assert!(gw.services.registry.is_empty());
}

#[test]
fn test_control_of_unknown_transfer_fails() {
    let gw = Gateway::new(true);
    assert!(gw.services.registry.pause(42, DEADLINE).is_err());
    assert!(gw.services.registry.cancel(42, DEADLINE).is_err());
    assert!(gw.services.registry.cancel_all(DEADLINE).is_ok());
}
