use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, Bson};
use mongodb::Client;

use isotope::cqrs::ReplicationProbe;
use isotope::errors::IsotopeResult;

use crate::repository::{command_code, driver_error, MongoRepository, NO_REPLICATION_ENABLED};

/// Measures replica-set lag from `replSetGetStatus`.
///
/// The reported lag is the gap between the primary's optime and the most
/// lagged secondary's, so a staleness bound checked against it holds for
/// every member a `secondaryPreferred` read could land on. A standalone
/// server reports zero lag.
pub struct MongoReplicationProbe {
    client: Client,
}

impl MongoReplicationProbe {
    pub fn new(client: Client) -> MongoReplicationProbe {
        MongoReplicationProbe { client }
    }

    pub fn for_repository(repository: &MongoRepository) -> MongoReplicationProbe {
        MongoReplicationProbe::new(repository.client().clone())
    }
}

#[async_trait]
impl ReplicationProbe for MongoReplicationProbe {
    async fn replication_lag(&self) -> IsotopeResult<Duration> {
        let status = match self
            .client
            .database("admin")
            .run_command(doc! { "replSetGetStatus": 1 })
            .await
        {
            Ok(status) => status,
            // standalone deployments do not replicate, reads are never stale
            Err(error) if command_code(&error) == Some(NO_REPLICATION_ENABLED) => {
                return Ok(Duration::ZERO)
            }
            Err(error) => return Err(driver_error("replSetGetStatus failed", error)),
        };
        Ok(lag_from_status(&status))
    }
}

fn lag_from_status(status: &mongodb::bson::Document) -> Duration {
    let members = match status.get_array("members") {
        Ok(members) => members,
        Err(_) => return Duration::ZERO,
    };
    let mut primary = None;
    let mut secondaries = Vec::new();
    for member in members {
        let Some(member) = member.as_document() else {
            continue;
        };
        let Some(optime) = member.get("optimeDate").and_then(Bson::as_datetime) else {
            continue;
        };
        match member.get_str("stateStr") {
            Ok("PRIMARY") => primary = Some(optime.timestamp_millis()),
            Ok("SECONDARY") => secondaries.push(optime.timestamp_millis()),
            _ => {}
        }
    }
    match (primary, secondaries.iter().min()) {
        (Some(primary), Some(&slowest)) if primary > slowest => {
            Duration::from_millis((primary - slowest) as u64)
        }
        _ => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::DateTime;

    fn member(state: &str, optime_millis: i64) -> mongodb::bson::Document {
        doc! {
            "stateStr": state,
            "optimeDate": DateTime::from_millis(optime_millis),
        }
    }

    #[test]
    fn test_lag_is_primary_minus_slowest_secondary() {
        let status = doc! {
            "members": [
                member("PRIMARY", 10_000),
                member("SECONDARY", 9_200),
                member("SECONDARY", 7_500),
                member("ARBITER", 0),
            ],
        };
        assert_eq!(lag_from_status(&status), Duration::from_millis(2_500));
    }

    #[test]
    fn test_lag_is_zero_without_secondaries() {
        let status = doc! { "members": [member("PRIMARY", 10_000)] };
        assert_eq!(lag_from_status(&status), Duration::ZERO);

        let status = doc! {};
        assert_eq!(lag_from_status(&status), Duration::ZERO);
    }

    #[test]
    fn test_lag_never_goes_negative() {
        // a secondary ahead of the stale primary reading clamps to zero
        let status = doc! {
            "members": [member("PRIMARY", 5_000), member("SECONDARY", 6_000)],
        };
        assert_eq!(lag_from_status(&status), Duration::ZERO);
    }
}
