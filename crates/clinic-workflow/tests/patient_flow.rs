//! 患者流转端到端测试

use chrono::{Duration as ChronoDuration, Utc};
use clinic_core::{
    BloodPressure, Demographics, Department, ErrorKind, Gender, InventoryItem, LabOrderStatus, LabTestRequest,
    PatientId, PrescriptionRequest, Priority, Status, Vitals,
};
use clinic_workflow::{EngineSettings, MemoryNotifier, TransitionPayload, WorkflowEngine};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> Arc<WorkflowEngine> {
    let settings = EngineSettings {
        lock_timeout: Duration::from_secs(2),
        ..EngineSettings::default()
    };
    Arc::new(WorkflowEngine::new(settings, Arc::new(MemoryNotifier::new())))
}

fn patient(name: &str, age: u32) -> Demographics {
    Demographics {
        name: name.to_string(),
        age,
        gender: Gender::Male,
        phone: "0933445566".to_string(),
        urgent: false,
    }
}

fn vitals() -> Vitals {
    Vitals {
        blood_pressure: BloodPressure { systolic: 124, diastolic: 82 },
        temperature_c: 36.9,
        heart_rate: 74,
        weight_kg: 71.0,
        chief_complaint: "Abdominal pain".to_string(),
    }
}

async fn to_doctor(engine: &WorkflowEngine, name: &str) -> PatientId {
    let id = engine.register_patient(patient(name, 40)).await.unwrap().id;
    engine.advance(id, Status::InTriage, TransitionPayload::None).await.unwrap();
    engine.record_vitals(id, vitals()).await.unwrap();
    engine.advance(id, Status::WithDoctor, TransitionPayload::None).await.unwrap();
    id
}

async fn stock(engine: &WorkflowEngine, drug_id: &str, quantity: u32) {
    let expiry = Utc::now().date_naive() + ChronoDuration::days(180);
    engine
        .add_inventory_item(InventoryItem::new(drug_id, drug_id, quantity, expiry))
        .await
        .unwrap();
}

/// 包含该患者（或其检验单）的科室队列数量
async fn queue_memberships(engine: &WorkflowEngine, id: PatientId) -> usize {
    let mut count = 0;
    for department in [Department::Opd, Department::Doctor, Department::Lab] {
        let entries = engine.list_queue(department).await.unwrap();
        if entries.iter().any(|e| e.patient_id == id) {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn registration_joins_tail_of_opd_queue() {
    let engine = engine();
    engine.register_patient(patient("Abebe", 30)).await.unwrap();
    let kebede = engine.register_patient(patient("Kebede", 62)).await.unwrap();

    assert_eq!(kebede.status, Status::Waiting);
    assert_eq!(kebede.record_number, "P-0002");
    let queue = engine.list_queue(Department::Opd).await.unwrap();
    assert_eq!(queue.last().unwrap().patient_id, kebede.id);
}

#[tokio::test]
async fn invalid_demographics_rejected() {
    let engine = engine();
    for bad in [patient("", 30), patient("Kebede", 151), Demographics { phone: " ".to_string(), ..patient("Kebede", 30) }] {
        let err = engine.register_patient(bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
    assert!(engine.list_patients().await.unwrap().is_empty());
    assert!(engine.list_queue(Department::Opd).await.unwrap().is_empty());
}

#[tokio::test]
async fn skipping_states_is_illegal_and_changes_nothing() {
    let engine = engine();
    let id = engine.register_patient(patient("Kebede", 62)).await.unwrap().id;

    let err = engine
        .advance(id, Status::Lab, TransitionPayload::None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransitionError);

    let after = engine.get_patient(id).await.unwrap();
    assert_eq!(after.status, Status::Waiting);
    assert_eq!(after.version, 1);
    assert_eq!(queue_memberships(&engine, id).await, 1);
}

#[tokio::test]
async fn lab_return_waits_for_every_result() {
    let engine = engine();
    let id = to_doctor(&engine, "Kebede").await;
    let tests = vec![
        LabTestRequest { test: "Complete Blood Count".to_string(), priority: Priority::High },
        LabTestRequest { test: "Glucose Fasting".to_string(), priority: Priority::Normal },
    ];
    engine
        .advance(id, Status::Lab, TransitionPayload::LabTests { tests })
        .await
        .unwrap();
    assert_eq!(queue_memberships(&engine, id).await, 1);
    assert_eq!(engine.list_queue(Department::Lab).await.unwrap().len(), 2);

    let orders = engine.list_active_lab_orders().await.unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].priority, Priority::High);

    let err = engine
        .advance(id, Status::WithDoctor, TransitionPayload::None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionNotMetError);

    for order in &orders {
        engine.begin_processing(order.id).await.unwrap();
        engine.upload_result(order.id, "within normal limits").await.unwrap();
    }
    let err = engine.upload_result(orders[0].id, "again").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransitionError);
    assert_eq!(queue_memberships(&engine, id).await, 0);

    let back = engine.advance(id, Status::WithDoctor, TransitionPayload::None).await.unwrap();
    assert_eq!(back.status, Status::WithDoctor);
    assert!(engine.list_active_lab_orders().await.unwrap().is_empty());
}

#[tokio::test]
async fn extra_lab_order_needs_lab_status() {
    let engine = engine();
    let id = to_doctor(&engine, "Kebede").await;

    let err = engine
        .create_lab_order(id, "Malaria Smear", Priority::Normal)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionNotMetError);

    let tests = vec![LabTestRequest { test: "Malaria Smear".to_string(), priority: Priority::Normal }];
    engine
        .advance(id, Status::Lab, TransitionPayload::LabTests { tests })
        .await
        .unwrap();
    let extra = engine.create_lab_order(id, "Urinalysis", Priority::High).await.unwrap();
    assert_eq!(extra.code, "LB-0002");

    let chart = engine.get_chart(id).await.unwrap();
    assert_eq!(chart.encounter.lab_orders.len(), 2);
}

#[tokio::test]
async fn equipment_holds_one_order_at_a_time() {
    let engine = engine();
    let first = to_doctor(&engine, "Kebede").await;
    let second = to_doctor(&engine, "Abebe").await;
    for id in [first, second] {
        let tests = vec![LabTestRequest { test: "Lipid Profile".to_string(), priority: Priority::Normal }];
        engine
            .advance(id, Status::Lab, TransitionPayload::LabTests { tests })
            .await
            .unwrap();
    }
    let orders = engine.list_active_lab_orders().await.unwrap();

    engine.begin_processing(orders[0].id).await.unwrap();
    let err = engine.begin_processing(orders[1].id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceBusyError);

    engine.upload_result(orders[0].id, "LDL 3.1").await.unwrap();
    let running = engine.begin_processing(orders[1].id).await.unwrap();
    assert_eq!(running.status, LabOrderStatus::InProcess);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_begin_processing_on_one_unit() {
    let engine = engine();
    let mut orders = Vec::new();
    for name in ["Kebede", "Abebe"] {
        let id = to_doctor(&engine, name).await;
        let tests = vec![LabTestRequest { test: "Lipid Profile".to_string(), priority: Priority::Normal }];
        engine
            .advance(id, Status::Lab, TransitionPayload::LabTests { tests })
            .await
            .unwrap();
    }
    for order in engine.list_active_lab_orders().await.unwrap() {
        orders.push(order.id);
    }
    assert_eq!(orders.len(), 2);

    let tasks: Vec<_> = orders
        .iter()
        .map(|&order_id| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.begin_processing(order_id).await })
        })
        .collect();
    let mut winners = 0;
    let mut busy = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(order) => {
                assert_eq!(order.status, LabOrderStatus::InProcess);
                winners += 1;
            }
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::ResourceBusyError);
                busy += 1;
            }
        }
    }
    assert_eq!((winners, busy), (1, 1));

    // 落败的检验单仍在检验队列中等待
    let waiting = engine.list_queue(Department::Lab).await.unwrap();
    assert_eq!(waiting.len(), 1);
    let loser = engine.get_lab_order(waiting[0].subject_id).await.unwrap();
    assert_eq!(loser.status, LabOrderStatus::PendingCollection);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispense_of_last_unit() {
    let engine = engine();
    stock(&engine, "AMX-500", 1).await;

    let mut prescriptions = Vec::new();
    for name in ["Kebede", "Abebe"] {
        let id = to_doctor(&engine, name).await;
        let payload = TransitionPayload::Prescriptions {
            prescriptions: vec![PrescriptionRequest {
                drug_id: "AMX-500".to_string(),
                units: 1,
                dosage: "500mg tid".to_string(),
                prescriber: "Dr. Tesfaye".to_string(),
            }],
        };
        engine.advance(id, Status::Pharmacy, payload).await.unwrap();
    }
    for rx in engine.list_pending_prescriptions().await.unwrap() {
        prescriptions.push(rx.id);
    }

    let handles: Vec<_> = prescriptions
        .iter()
        .map(|&rx| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.dispense(rx).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::InsufficientStockError),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(engine.get_inventory_level("AMX-500").await.unwrap().quantity, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversubscribed_stock_never_goes_negative() {
    let engine = engine();
    stock(&engine, "PCM-500", 25).await;

    let mut ids = Vec::new();
    for i in 0..8 {
        let id = to_doctor(&engine, &format!("Patient {}", i)).await;
        let payload = TransitionPayload::Prescriptions {
            prescriptions: vec![PrescriptionRequest {
                drug_id: "PCM-500".to_string(),
                units: 6,
                dosage: "1 tab qid".to_string(),
                prescriber: "Dr. Tesfaye".to_string(),
            }],
        };
        engine.advance(id, Status::Pharmacy, payload).await.unwrap();
        ids.push(id);
    }

    let pending = engine.list_pending_prescriptions().await.unwrap();
    let handles: Vec<_> = pending
        .into_iter()
        .map(|rx| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.dispense(rx.id).await })
        })
        .collect();

    let mut dispensed = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            dispensed += 1;
        }
    }
    assert_eq!(dispensed, 4);
    assert_eq!(engine.get_inventory_level("PCM-500").await.unwrap().quantity, 1);

    // 未发药的处方取消后即可离院
    for rx in engine.list_pending_prescriptions().await.unwrap() {
        engine.cancel_prescription(rx.id).await.unwrap();
    }
    for id in ids {
        engine.advance(id, Status::Discharged, TransitionPayload::None).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advance_has_single_winner() {
    let engine = engine();
    let id = engine.register_patient(patient("Kebede", 62)).await.unwrap().id;

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.advance(id, Status::InTriage, TransitionPayload::None).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::IllegalTransitionError),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(engine.get_patient(id).await.unwrap().version, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_call_next_serves_each_patient_once() {
    let engine = engine();
    let mut registered = HashSet::new();
    for i in 0..5 {
        registered.insert(engine.register_patient(patient(&format!("P{}", i), 20)).await.unwrap().id);
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.call_next(Department::Opd).await })
        })
        .collect();

    let mut called = HashSet::new();
    let mut empty = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Some(patient) => assert!(called.insert(patient.id)),
            None => empty += 1,
        }
    }
    assert_eq!(called, registered);
    assert_eq!(empty, 3);
    assert!(engine.list_queue(Department::Opd).await.unwrap().is_empty());
}

#[tokio::test]
async fn patient_is_in_at_most_one_queue_throughout_visit() {
    let engine = engine();
    stock(&engine, "ORS", 40).await;
    let id = engine.register_patient(patient("Kebede", 62)).await.unwrap().id;
    assert_eq!(queue_memberships(&engine, id).await, 1);

    engine.call_next(Department::Opd).await.unwrap();
    assert_eq!(queue_memberships(&engine, id).await, 0);

    engine.record_vitals(id, vitals()).await.unwrap();
    engine.advance(id, Status::WithDoctor, TransitionPayload::None).await.unwrap();
    assert_eq!(queue_memberships(&engine, id).await, 1);

    let called = engine.call_next(Department::Doctor).await.unwrap().unwrap();
    assert_eq!(called.id, id);
    assert_eq!(called.status, Status::WithDoctor);
    assert_eq!(queue_memberships(&engine, id).await, 0);

    let tests = vec![LabTestRequest { test: "Stool Microscopy".to_string(), priority: Priority::Normal }];
    engine
        .advance(id, Status::Lab, TransitionPayload::LabTests { tests })
        .await
        .unwrap();
    assert_eq!(queue_memberships(&engine, id).await, 1);

    let order = engine.list_active_lab_orders().await.unwrap().remove(0);
    engine.begin_processing(order.id).await.unwrap();
    assert_eq!(queue_memberships(&engine, id).await, 0);
    engine.upload_result(order.id, "no ova or parasites").await.unwrap();
    engine.advance(id, Status::WithDoctor, TransitionPayload::None).await.unwrap();
    assert_eq!(queue_memberships(&engine, id).await, 0);

    let payload = TransitionPayload::Prescriptions {
        prescriptions: vec![PrescriptionRequest {
            drug_id: "ORS".to_string(),
            units: 4,
            dosage: "after each loose stool".to_string(),
            prescriber: "Dr. Tesfaye".to_string(),
        }],
    };
    engine.advance(id, Status::Pharmacy, payload).await.unwrap();
    assert_eq!(queue_memberships(&engine, id).await, 0);

    let rx = engine.list_pending_prescriptions().await.unwrap().remove(0);
    engine.dispense(rx.id).await.unwrap();
    engine.advance(id, Status::Discharged, TransitionPayload::None).await.unwrap();

    engine
        .advance(id, Status::Waiting, TransitionPayload::Revisit { urgent: false })
        .await
        .unwrap();
    assert_eq!(queue_memberships(&engine, id).await, 1);
}

#[tokio::test]
async fn failsafe_from_every_state() {
    let engine = engine();
    stock(&engine, "AMX-500", 10).await;

    let waiting = engine.register_patient(patient("Waiting", 30)).await.unwrap().id;
    let with_doctor = to_doctor(&engine, "Doctor").await;
    let in_lab = to_doctor(&engine, "Lab").await;
    let tests = vec![LabTestRequest { test: "Complete Blood Count".to_string(), priority: Priority::Normal }];
    engine
        .advance(in_lab, Status::Lab, TransitionPayload::LabTests { tests })
        .await
        .unwrap();
    let in_pharmacy = to_doctor(&engine, "Pharmacy").await;
    let payload = TransitionPayload::Prescriptions {
        prescriptions: vec![PrescriptionRequest {
            drug_id: "AMX-500".to_string(),
            units: 2,
            dosage: "bid".to_string(),
            prescriber: "Dr. Tesfaye".to_string(),
        }],
    };
    engine.advance(in_pharmacy, Status::Pharmacy, payload).await.unwrap();

    for id in [waiting, with_doctor, in_lab, in_pharmacy] {
        let patient = engine.discharge_failsafe(id).await.unwrap();
        assert_eq!(patient.status, Status::Discharged);
        assert_eq!(queue_memberships(&engine, id).await, 0);
    }
    assert!(engine.list_pending_prescriptions().await.unwrap().is_empty());
    assert_eq!(engine.get_inventory_level("AMX-500").await.unwrap().quantity, 10);

    let err = engine.discharge_failsafe(uuid::Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFoundError);
}
