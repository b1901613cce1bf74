use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::messages::Ingress;
use crate::mqtt::MqttClient;
use crate::scheduler::{Scheduler, SchedulerHandle};

pub struct Manager {
    mqtt_client: MqttClient,
    mqtt_event_loop: rumqttc::EventLoop,
    scheduler: Scheduler,
    handle: SchedulerHandle,
}

impl Manager {
    pub fn new(
        mqtt_client: MqttClient,
        mqtt_event_loop: rumqttc::EventLoop,
        scheduler: Scheduler,
        handle: SchedulerHandle,
    ) -> Self {
        Manager {
            mqtt_client,
            mqtt_event_loop,
            scheduler,
            handle,
        }
    }

    pub async fn run_loop(self) -> anyhow::Result<()> {
        let Manager {
            mqtt_client,
            mut mqtt_event_loop,
            scheduler,
            handle,
        } = self;

        // Single producer, single consumer. A full channel holds back the
        // MQTT loop instead of dropping reports.
        let (tx, mut rx) = mpsc::channel(64);

        let mqtt_task = {
            let mqtt_client = mqtt_client.clone();
            tokio::spawn(async move {
                mqtt_client.event_loop(&mut mqtt_event_loop, tx).await;
            })
        };
        let scheduler_task = tokio::spawn(scheduler.run());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down");
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => handle_ingress(&mqtt_client, &handle, msg).await,
                    None => {
                        debug!("Ingress channel closed");
                        break;
                    }
                }
            }
        }
        info!("Exiting manager event loop");

        drop(handle);
        if let Err(err) = scheduler_task.await {
            error!("Scheduler task failed: {:?}", err);
        }
        mqtt_task.abort();

        mqtt_client.disconnect().await?;

        Ok(())
    }
}

async fn handle_ingress(mqtt_client: &MqttClient, handle: &SchedulerHandle, msg: Ingress) {
    let result = match msg {
        Ingress::StateReport { address, state } => {
            if let Err(err) = handle.report_state_change(address.clone(), state).await {
                warn!("Rejected state report for {}: {}", address, err);
            }
            Ok(())
        }
        Ingress::StateQuery { address } => match handle.get_state(address.clone()).await {
            Ok(status) => mqtt_client.publish_status(&address, &status),
            Err(err) => Err(err.into()),
        },
        Ingress::CancelPending { address } => match handle.cancel_pending(address.clone()).await {
            Ok(cancelled) => {
                debug!("Cancel request for {}: cancelled={}", address, cancelled);
                Ok(())
            }
            Err(err) => Err(err.into()),
        },
        Ingress::TestPush { address } => match handle.send_test(address.clone()).await {
            Ok(outcome) => {
                info!("Test push for {}: {:?}", address, outcome);
                Ok(())
            }
            Err(err) => {
                warn!("Rejected test push for {}: {}", address, err);
                Ok(())
            }
        },
        Ingress::SnapshotRequest => match handle.snapshot().await {
            Ok(records) => mqtt_client.publish_snapshot(&records),
            Err(err) => Err(err.into()),
        },
    };

    if let Err(err) = result {
        error!("Error handling ingress message: {:?}", err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::{DispatchSettings, MqttConfig};
    use crate::messages::LifecycleState;
    use crate::transport::testing::RecordingTransport;

    fn offline_client() -> MqttClient {
        let (client, _eventloop) = MqttClient::new(&MqttConfig {
            host: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            publisher_id: None,
            topic_path: None,
            keep_alive_seconds: None,
        });
        client
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_burst_is_applied_in_order() {
        let transport = RecordingTransport::new();
        let settings = DispatchSettings {
            debounce: Duration::ZERO,
            ..DispatchSettings::default()
        };
        let (scheduler, handle) = Scheduler::new(Arc::new(transport.clone()), settings);
        tokio::spawn(scheduler.run());

        let (tx, mut rx) = mpsc::channel(4);
        let producer = tokio::spawn(async move {
            for i in 0..200 {
                let state = if i % 2 == 0 { "background" } else { "foreground" };
                tx.send(Ingress::StateReport {
                    address: "a".to_string(),
                    state: state.to_string(),
                })
                .await
                .unwrap();
            }
        });

        let mqtt_client = offline_client();
        let mut handled = 0;
        while let Some(msg) = rx.recv().await {
            handle_ingress(&mqtt_client, &handle, msg).await;
            handled += 1;
        }
        producer.await.unwrap();

        assert_eq!(handled, 200);
        assert_eq!(
            handle.get_state("a").await.unwrap().state,
            LifecycleState::Foreground
        );
        // one immediate push per background report, every follow-up cancelled
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.sent_to("a"), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_test_push_ingress_reaches_transport() {
        let transport = RecordingTransport::new();
        let (scheduler, handle) =
            Scheduler::new(Arc::new(transport.clone()), DispatchSettings::default());
        tokio::spawn(scheduler.run());

        let mqtt_client = offline_client();
        handle_ingress(
            &mqtt_client,
            &handle,
            Ingress::TestPush {
                address: "tok".to_string(),
            },
        )
        .await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.title, "Push Notify");
    }
}
