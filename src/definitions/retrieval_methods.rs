//! Normalisation of the connection methods advertised in an engagement.
//!
//! Engagements in the wild repeat methods, split a single BLE service across
//! two entries with complementary role flags, or advertise modes with no
//! usable role. Both parties run the same normalisation so they agree on the
//! candidate list.
use crate::definitions::device_engagement::{
    BleOptions, DeviceRetrievalMethod, DeviceRetrievalMethods,
};
use crate::definitions::helpers::NonEmptyVec;
use crate::definitions::session::Role;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no usable connection method remains after disambiguation")]
    NoUsableMethod,
}

/// Collapse duplicate and complementary methods into a canonical candidate
/// list, and reject engagements advertising an entry the acting side cannot
/// take any transport role for. The result is stable: disambiguating twice
/// yields the same list.
pub fn disambiguate(
    methods: &DeviceRetrievalMethods,
    role: Role,
) -> Result<DeviceRetrievalMethods, Error> {
    let mut out: Vec<DeviceRetrievalMethod> = Vec::new();
    for method in methods.iter() {
        match method {
            DeviceRetrievalMethod::NFC(options) => {
                let candidate = DeviceRetrievalMethod::NFC(options.clone());
                if !out.contains(&candidate) {
                    out.push(candidate);
                }
            }
            DeviceRetrievalMethod::BLE(options) => merge_ble(&mut out, options),
        }
    }
    if !out.iter().all(|method| usable_by(method, role)) {
        return Err(Error::NoUsableMethod);
    }
    NonEmptyVec::maybe_new(out).ok_or(Error::NoUsableMethod)
}

/// Whether the acting side can take any transport role for this entry. A BLE
/// entry without mode flags leaves nothing for either side to connect or
/// serve as.
fn usable_by(method: &DeviceRetrievalMethod, role: Role) -> bool {
    match method {
        DeviceRetrievalMethod::NFC(_) => true,
        DeviceRetrievalMethod::BLE(options) => {
            let as_central = match role {
                Role::Reader => options.peripheral_server_mode.is_some(),
                Role::Device => options.central_client_mode.is_some(),
            };
            let as_peripheral = match role {
                Role::Reader => options.central_client_mode.is_some(),
                Role::Device => options.peripheral_server_mode.is_some(),
            };
            as_central || as_peripheral
        }
    }
}

/// Fold a BLE entry into the candidate list. Two entries that share a service
/// UUID are the same transport advertised once per role, so their role flags
/// are unioned into a single method.
fn merge_ble(out: &mut Vec<DeviceRetrievalMethod>, options: &BleOptions) {
    for existing in out.iter_mut() {
        let DeviceRetrievalMethod::BLE(existing) = existing else {
            continue;
        };
        if !shares_uuid(existing, options) {
            continue;
        }
        if existing.peripheral_server_mode.is_none() {
            existing.peripheral_server_mode = options.peripheral_server_mode.clone();
        }
        if existing.central_client_mode.is_none() {
            existing.central_client_mode = options.central_client_mode.clone();
        }
        return;
    }
    out.push(DeviceRetrievalMethod::BLE(options.clone()));
}

fn shares_uuid(a: &BleOptions, b: &BleOptions) -> bool {
    let uuids = |o: &BleOptions| {
        [
            o.peripheral_server_mode.as_ref().map(|m| m.uuid),
            o.central_client_mode.as_ref().map(|m| m.uuid),
        ]
    };
    let a = uuids(a);
    uuids(b)
        .into_iter()
        .flatten()
        .any(|uuid| a.iter().flatten().any(|other| *other == uuid))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::device_engagement::{CentralClientMode, PeripheralServerMode};
    use uuid::Uuid;

    fn central(uuid: Uuid) -> DeviceRetrievalMethod {
        DeviceRetrievalMethod::BLE(BleOptions {
            peripheral_server_mode: None,
            central_client_mode: Some(CentralClientMode { uuid }),
        })
    }

    fn peripheral(uuid: Uuid) -> DeviceRetrievalMethod {
        DeviceRetrievalMethod::BLE(BleOptions {
            peripheral_server_mode: Some(PeripheralServerMode {
                uuid,
                ble_device_address: None,
            }),
            central_client_mode: None,
        })
    }

    #[test]
    fn duplicates_collapse() {
        let uuid = Uuid::new_v4();
        let methods =
            NonEmptyVec::try_from(vec![central(uuid), central(uuid), central(uuid)]).unwrap();
        let out = disambiguate(&methods, Role::Reader).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn flagless_ble_entry_is_rejected_for_both_roles() {
        let methods = NonEmptyVec::new(DeviceRetrievalMethod::BLE(BleOptions {
            peripheral_server_mode: None,
            central_client_mode: None,
        }));
        assert!(matches!(
            disambiguate(&methods, Role::Reader),
            Err(Error::NoUsableMethod)
        ));
        assert!(matches!(
            disambiguate(&methods, Role::Device),
            Err(Error::NoUsableMethod)
        ));
    }

    #[test]
    fn complementary_role_flags_merge() {
        let uuid = Uuid::new_v4();
        let methods = NonEmptyVec::try_from(vec![central(uuid), peripheral(uuid)]).unwrap();
        let out = disambiguate(&methods, Role::Reader).unwrap();
        assert_eq!(out.len(), 1);
        let DeviceRetrievalMethod::BLE(options) = &out[0] else {
            panic!("expected a BLE method");
        };
        assert!(options.peripheral_server_mode.is_some());
        assert!(options.central_client_mode.is_some());
    }

    #[test]
    fn distinct_uuids_stay_separate() {
        let methods =
            NonEmptyVec::try_from(vec![central(Uuid::new_v4()), peripheral(Uuid::new_v4())])
                .unwrap();
        let out = disambiguate(&methods, Role::Device).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn idempotent() {
        let uuid = Uuid::new_v4();
        let methods = NonEmptyVec::try_from(vec![
            central(uuid),
            peripheral(uuid),
            central(Uuid::new_v4()),
        ])
        .unwrap();
        let once = disambiguate(&methods, Role::Reader).unwrap();
        let twice = disambiguate(&once, Role::Reader).unwrap();
        assert_eq!(once, twice);
    }
}
