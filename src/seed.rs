//! Demo directory content
//!
//! Loaded at startup when `SEED_DEMO_DATA=true`. The small builders are also
//! what the test suites use to set up clients, contacts and dispatchers.

use chrono::NaiveDate;
use tracing::info;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    Address, Client, ClientInput, ContactInput, Device, DeviceInput, DeviceType, Dispatcher,
    DispatcherInput, DispatcherRole, DispatcherStatus, EmergencyContact, Medication,
    MedicationInput, Relationship,
};
use crate::store::Repository;

pub fn client(first_name: &str, last_name: &str) -> Client {
    ClientInput {
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        birth_date: NaiveDate::from_ymd_opt(1938, 4, 12).unwrap_or_default(),
        address: Address {
            street: "Lindenallee 14".to_string(),
            postal_code: "10115".to_string(),
            city: "Berlin".to_string(),
        },
        phone: Some("030 1234567".to_string()),
        conditions: vec!["Atrial fibrillation".to_string()],
        medical_notes: None,
    }
    .into()
}

/// Family contact reachable by mobile
pub fn contact(client_id: Uuid, name: &str, priority: u8) -> EmergencyContact {
    ContactInput {
        name: name.to_string(),
        relationship: Relationship::Child,
        phone: None,
        mobile: Some(format!("0171 55500{:02}", priority)),
        email: None,
        priority,
        is_key_holder: priority == 1,
    }
    .into_contact(client_id)
}

pub fn physician(client_id: Uuid, name: &str) -> EmergencyContact {
    ContactInput {
        name: name.to_string(),
        relationship: Relationship::Physician,
        phone: Some("030 9876543".to_string()),
        mobile: None,
        email: None,
        priority: 10,
        is_key_holder: false,
    }
    .into_contact(client_id)
}

pub fn medication(client_id: Uuid, name: &str, dosage: &str, priority: u8) -> Medication {
    MedicationInput {
        name: name.to_string(),
        dosage: dosage.to_string(),
        frequency: "once daily".to_string(),
        prescribed_by: Some("Dr. Hoffmann".to_string()),
        emergency_notes: None,
        priority,
    }
    .into_medication(client_id)
}

pub fn device(client_id: Option<Uuid>, serial_number: &str, device_type: DeviceType) -> Device {
    DeviceInput {
        serial_number: serial_number.to_string(),
        device_type,
        client_id,
        battery_level: Some(90),
    }
    .into()
}

pub fn dispatcher(name: &str, extension: &str) -> Dispatcher {
    DispatcherInput {
        name: name.to_string(),
        email: format!("{}@servicehub.example", name.to_lowercase()),
        phone: None,
        extension: extension.to_string(),
        role: DispatcherRole::Agent,
    }
    .into()
}

/// Populate the repository with a small, realistic demo directory
pub async fn load_demo_data(repo: &dyn Repository) -> AppResult<()> {
    let mut margarete = client("Margarete", "Schulz");
    margarete.medical_notes = Some("Hearing impaired, speak slowly".to_string());
    let margarete = repo.insert_client(margarete).await?;

    let mut heinz = client("Heinz", "Bauer");
    heinz.address = Address {
        street: "Am Markt 3".to_string(),
        postal_code: "04109".to_string(),
        city: "Leipzig".to_string(),
    };
    heinz.conditions = vec!["Diabetes type 2".to_string(), "Hip replacement".to_string()];
    let heinz = repo.insert_client(heinz).await?;

    for (client_id, names) in [
        (margarete.id, ["Sabine Schulz", "Thomas Schulz"]),
        (heinz.id, ["Petra Bauer", "Nachbarin Frau Kühn"]),
    ] {
        for (rank, name) in names.iter().enumerate() {
            repo.insert_contact(contact(client_id, name, rank as u8 + 1)).await?;
        }
        repo.insert_contact(physician(client_id, "Dr. med. Hoffmann")).await?;
    }

    let mut warfarin = medication(margarete.id, "Warfarin", "5 mg", 9);
    warfarin.emergency_notes = Some("Anticoagulant - bleeding risk".to_string());
    repo.insert_medication(warfarin).await?;
    repo.insert_medication(medication(margarete.id, "Metoprolol", "47.5 mg", 6)).await?;
    let mut insulin = medication(heinz.id, "Insulin glargine", "20 IU", 9);
    insulin.frequency = "evening".to_string();
    insulin.emergency_notes = Some("Check blood glucose".to_string());
    repo.insert_medication(insulin).await?;
    repo.insert_medication(medication(heinz.id, "Metformin", "1000 mg", 5)).await?;

    repo.insert_device(device(Some(margarete.id), "EB-1001", DeviceType::EmergencyButton))
        .await?;
    repo.insert_device(device(Some(margarete.id), "FD-2001", DeviceType::FallDetector))
        .await?;
    repo.insert_device(device(Some(heinz.id), "SW-3001", DeviceType::Smartwatch))
        .await?;
    repo.insert_device(device(None, "HS-4001", DeviceType::HomeStation)).await?;

    for (name, extension, role) in [
        ("Anna", "e1", DispatcherRole::Supervisor),
        ("Jonas", "e2", DispatcherRole::Agent),
        ("Mehmet", "e3", DispatcherRole::Agent),
    ] {
        let mut entry = dispatcher(name, extension);
        entry.role = role;
        let entry = repo.insert_dispatcher(entry).await?;
        if role == DispatcherRole::Supervisor {
            repo.set_dispatcher_status(entry.id, DispatcherStatus::Online).await?;
        }
    }

    info!("Demo directory data loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_demo_data_is_consistent() {
        let store = MemoryStore::new();
        load_demo_data(&store).await.unwrap();

        let clients = store.list_clients().await.unwrap();
        assert_eq!(clients.len(), 2);
        for client in &clients {
            let contacts = store.list_contacts(client.id).await.unwrap();
            assert_eq!(contacts.len(), 3);
            assert!(contacts.iter().any(|c| c.relationship == Relationship::Physician));
            assert!(!store.list_medications(client.id).await.unwrap().is_empty());
        }
        assert_eq!(store.list_devices().await.unwrap().len(), 4);
        assert_eq!(store.list_dispatchers().await.unwrap().len(), 3);
    }
}
