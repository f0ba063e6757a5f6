#![allow(clippy::cognitive_complexity)]
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use futures::StreamExt;
use nats_client::{Client, Message, Subscriber};
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_futures::Instrument;

mod cli;
mod trace;

use cli::{Command, Parser};

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::init(&config.log, &config.log_format)?;
    debug!(?config, ?trace_config);

    let mut builder = Builder::new_multi_thread();
    builder.thread_name(cli::DEFAULT_THREAD_NAME).enable_all();
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(start(config).instrument(info_span!("natsc"))).await {
            Err(err) => Err(anyhow!(err).context("natsc task panicked")),
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    let mut opts = config
        .connect_options()?
        .on_disconnect(|| warn!("disconnected, reconnecting"))
        .on_reconnect(|| info!("reconnected"))
        .on_close(|| debug!("connection closed"));
    if let Some(timeout) = config.command.request_timeout() {
        opts = opts.request_timeout(timeout);
    }
    let client = opts.connect().await.context("failed to connect")?;
    info!(server = ?client.connected_server(), "connected");

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    let res = match config.command {
        Command::Pub {
            subject,
            payload,
            reply,
        } => {
            match reply {
                Some(reply) => {
                    client
                        .publish_with_reply(subject.as_str(), reply, payload)
                        .await?
                }
                None => client.publish(subject.as_str(), payload).await?,
            }
            client.flush().await?;
            info!(%subject, "published");
            Ok(())
        }
        Command::Sub {
            subject,
            queue,
            count,
        } => {
            let sub = subscribe(&client, subject, queue).await?;
            print_messages(sub, count, token).await
        }
        Command::Req {
            subject, payload, ..
        } => {
            let reply = client.request(subject, payload).await?;
            println!("{}", String::from_utf8_lossy(&reply.payload));
            Ok(())
        }
        Command::Reply {
            subject,
            payload,
            queue,
        } => {
            let sub = subscribe(&client, subject, queue).await?;
            answer_requests(&client, sub, Bytes::from(payload), token).await
        }
    };
    client.close().await;
    res
}

async fn subscribe(client: &Client, subject: String, queue: Option<String>) -> Result<Subscriber> {
    let sub = match queue {
        Some(queue) => client.queue_subscribe(subject, queue).await?,
        None => client.subscribe(subject).await?,
    };
    client.flush().await?;
    info!(subject = sub.subject(), "listening");
    Ok(sub)
}

async fn print_messages(
    mut sub: Subscriber,
    count: Option<u64>,
    token: CancellationToken,
) -> Result<()> {
    let mut seen = 0_u64;
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            msg = sub.next() => msg,
        };
        let Some(msg) = msg else {
            return Err(anyhow!("subscription closed"));
        };
        seen += 1;
        print_message(seen, &msg);
        if count.is_some_and(|n| seen >= n) {
            return Ok(());
        }
    }
}

fn print_message(n: u64, msg: &Message) {
    match &msg.reply {
        Some(reply) => println!(
            "[#{n}] {} (reply {reply}): {}",
            msg.subject,
            String::from_utf8_lossy(&msg.payload)
        ),
        None => println!(
            "[#{n}] {}: {}",
            msg.subject,
            String::from_utf8_lossy(&msg.payload)
        ),
    }
}

async fn answer_requests(
    client: &Client,
    mut sub: Subscriber,
    payload: Bytes,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            msg = sub.next() => msg,
        };
        let Some(msg) = msg else {
            return Err(anyhow!("subscription closed"));
        };
        let Some(reply) = msg.reply else {
            debug!(subject = %msg.subject, "ignoring message without reply subject");
            continue;
        };
        if let Err(err) = client.publish(reply, payload.clone()).await {
            warn!(?err, "failed to send reply");
        }
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
