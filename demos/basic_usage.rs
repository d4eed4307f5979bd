use redisque::{
    ConnectionConfig, ConnectionManager, Consumer, ConsumerOptions, Payload, Priority,
    QueueManager, QueueOptions, Reclaimer, ReclaimerOptions,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct EmailData {
    to: String,
    subject: String,
    body: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessData {
    input: String,
    complexity: u32,
}

fn to_payload<T: Serialize>(data: &T) -> Result<Payload, serde_json::Error> {
    match serde_json::to_value(data)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Ok(Payload::new()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let connections = ConnectionManager::new(ConnectionConfig::new("127.0.0.1", 6379));
    let manager = QueueManager::connect(&connections, "").await?;

    // A plain FIFO queue for emails
    let emails = manager
        .new_queue(QueueOptions::new("emails").expire(3600))
        .await?;

    for i in 0..5 {
        emails
            .push(
                to_payload(&EmailData {
                    to: format!("user{}@example.com", i),
                    subject: "Welcome".to_string(),
                    body: "Hello!".to_string(),
                })?,
                0,
            )
            .await?;
    }
    println!("Queued {} emails", emails.len().await?);

    // A weight-ordered queue for CPU-heavy work
    let heavy = manager
        .new_queue(
            QueueOptions::new("process_data")
                .sorted(true)
                .priority(Priority::High),
        )
        .await?;

    for (weight, complexity) in [(10, 100), (90, 5000), (50, 1000)] {
        heavy
            .add(
                to_payload(&ProcessData {
                    input: "large dataset".to_string(),
                    complexity,
                })?,
                weight,
            )
            .await?;
    }

    let email_consumer = Consumer::new(
        emails,
        ConsumerOptions {
            concurrency: 3,
            num_workers: 2,
            ..Default::default()
        },
    );
    email_consumer
        .register_async_handler(|data: EmailData| async move {
            println!("Sending email to: {}", data.to);
            tokio::time::sleep(Duration::from_secs(1)).await;
            println!("Email sent to: {}", data.to);
            Ok(())
        })
        .await;

    let heavy_consumer = Consumer::new(heavy, ConsumerOptions::default());
    heavy_consumer
        .register_sync_handler(|data: ProcessData| {
            println!("Processing data with complexity: {}", data.complexity);
            std::thread::sleep(Duration::from_millis(500));
            println!("Data processed: {}", data.input);
            Ok(())
        })
        .await;

    // Returns messages of crashed consumers to their queues
    let reclaimer = Reclaimer::new(manager.clone(), ReclaimerOptions::default());

    let handles = vec![
        tokio::spawn({
            let consumer = email_consumer.clone();
            async move { consumer.start().await }
        }),
        tokio::spawn({
            let consumer = heavy_consumer.clone();
            async move { consumer.start().await }
        }),
        tokio::spawn({
            let reclaimer = reclaimer.clone();
            async move { reclaimer.start().await }
        }),
    ];

    println!("Workers started, running for 10 seconds.");
    tokio::time::sleep(Duration::from_secs(10)).await;

    email_consumer.stop().await;
    heavy_consumer.stop().await;
    reclaimer.stop().await;
    futures::future::join_all(handles).await;

    println!(
        "Finished: {:?} / {:?}",
        email_consumer.metrics(),
        heavy_consumer.metrics()
    );

    Ok(())
}
