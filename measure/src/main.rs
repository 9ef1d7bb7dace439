use aws_sdk_s3::{primitives::ByteStream, Client};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env::args,
    path::Path,
    time::{Duration, Instant},
};
use tokio::fs::{read, read_to_string};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
struct Measurement {
    key: String,
    upload_duration: f64,
    total_duration: f64,
    original_size: usize,
    size: usize,
}

impl Measurement {
    fn compression_ratio(&self) -> f64 {
        (self.original_size as f64 - self.size as f64) / self.original_size as f64
    }
}

struct Buckets {
    source: String,
    destination: String,
}

async fn test(client: &Client, buckets: &Buckets, key: String, body: Vec<u8>) -> Option<Measurement> {
    let original_size = body.len();
    let start_time = Instant::now();

    if let Err(err) = client
        .put_object()
        .bucket(&buckets.source)
        .key(&key)
        .body(ByteStream::from(body))
        .send()
        .await
    {
        eprintln!("{key}: upload failed: {err}");
        return None;
    }
    let upload_duration = start_time.elapsed().as_secs_f64() * 1000.0;

    loop {
        let found = client
            .head_object()
            .bucket(&buckets.destination)
            .key(&key)
            .send()
            .await
            .is_ok();
        if found {
            break;
        }
        if start_time.elapsed() > POLL_TIMEOUT {
            eprintln!("{key}: no output after {}s", POLL_TIMEOUT.as_secs());
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    let total_duration = start_time.elapsed().as_secs_f64() * 1000.0;

    let output = match client
        .get_object()
        .bucket(&buckets.destination)
        .key(&key)
        .send()
        .await
    {
        Ok(output) => output,
        Err(err) => {
            eprintln!("{key}: download failed: {err}");
            return None;
        }
    };
    let size = match output.body.collect().await {
        Ok(data) => data.into_bytes().len(),
        Err(err) => {
            eprintln!("{key}: reading output failed: {err}");
            return None;
        }
    };

    Some(Measurement {
        key,
        upload_duration,
        total_duration,
        original_size,
        size,
    })
}

fn find_buckets(cdk_outputs: &HashMap<String, HashMap<String, String>>) -> Option<Buckets> {
    cdk_outputs.values().find_map(|outputs| {
        let lookup = |prefix: &str| {
            outputs
                .iter()
                .find(|(k, _)| k.starts_with(prefix))
                .map(|(_, v)| v.clone())
        };
        Some(Buckets {
            source: lookup("SourceBucketName")?,
            destination: lookup("DestinationBucketName")?,
        })
    })
}

#[tokio::main]
async fn main() {
    let mut args = args();
    let prog = args.next().unwrap_or_else(|| "measure".to_string());
    let [Some(cdk_outputs_file), Some(photo_file)] = [args.next(), args.next()] else {
        eprintln!("Usage:\n{prog} cdk-outputs.json photo.jpg [count]");
        return;
    };
    let count: usize = match args.next().map(|c| c.parse()) {
        None => 10,
        Some(Ok(count)) if count > 0 => count,
        Some(_) => {
            eprintln!("count must be a positive integer");
            return;
        }
    };

    let path = Path::new(&cdk_outputs_file)
        .parent()
        .unwrap_or(Path::new("."));

    let cdk_outputs_json = read_to_string(&cdk_outputs_file)
        .await
        .unwrap_or_else(|err| panic!("{cdk_outputs_file}: Failed to read: {err}"));

    let cdk_outputs: HashMap<String, HashMap<String, String>> =
        serde_json::from_str(&cdk_outputs_json)
            .unwrap_or_else(|err| panic!("{cdk_outputs_file}: Failed to parse: {err}"));

    let Some(buckets) = find_buckets(&cdk_outputs) else {
        eprintln!("{cdk_outputs_file}: no SourceBucketName/DestinationBucketName outputs");
        return;
    };

    let photo = read(&photo_file)
        .await
        .unwrap_or_else(|err| panic!("{photo_file}: Failed to read: {err}"));
    let file_name = Path::new(&photo_file)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| photo_file.clone());

    let config = aws_config::load_from_env().await;
    let client = Client::new(&config);

    eprintln!(
        "Uploading {count} copies of {file_name} to {} -> {}",
        buckets.source, buckets.destination
    );

    let run_id = std::process::id();
    let results: Vec<Measurement> = join_all((0..count).map(|n| {
        let key = format!("photos/measure-{run_id}-{n}-{file_name}");
        test(&client, &buckets, key, photo.clone())
    }))
    .await
    .into_iter()
    .flatten()
    .collect();

    let results_json =
        serde_json::to_string_pretty(&results).expect("measurements serialize to JSON");
    let results_path = path.join("measure.json");
    eprintln!("Results: {results_path:?}");
    tokio::fs::write(&results_path, results_json)
        .await
        .unwrap_or_else(|err| panic!("{results_path:?}: Failed to write: {err}"));

    let failed = count - results.len();
    if failed > 0 {
        println!("{failed} of {count} uploads produced no output");
    }
    if results.is_empty() {
        return;
    }

    let (min, max, avg) = min_max_avg(&results, |m| m.upload_duration);
    println!("upload min={min:4.02} max={max:4.02} avg={avg:4.02}");

    let (min, max, avg) = min_max_avg(&results, |m| m.total_duration);
    println!("total  min={min:4.02} max={max:4.02} avg={avg:4.02}");

    let (_, _, avg) = min_max_avg(&results, Measurement::compression_ratio);
    println!("compression avg={:.2}%", avg * 100.0);
}

fn min_max_avg(measurements: &[Measurement], f: impl Fn(&Measurement) -> f64) -> (f64, f64, f64) {
    let min = measurements.iter().fold(f64::MAX, |a, m| a.min(f(m)));
    let max = measurements.iter().fold(f64::MIN, |a, m| a.max(f(m)));
    let avg = measurements.iter().map(f).sum::<f64>() / measurements.len() as f64;

    (min, max, avg)
}
