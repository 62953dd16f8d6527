use redis::aio::MultiplexedConnection;
use redis::{RedisError, Value};
use serial_test::serial;
use tokio::time::{sleep, Duration, Instant};

use shardis::config::Config;
use shardis::server::run;

/// Starts a server on `port` with the given flags and waits for it to listen.
async fn start(port: u16, args: &[&str]) {
    let port = port.to_string();
    let argv = ["shardis", "--port", port.as_str()]
        .into_iter()
        .chain(args.iter().copied());
    let config = Config::load_from(argv).unwrap();

    tokio::spawn(run(config));
    sleep(Duration::from_millis(100)).await;
}

async fn connect(url: &str) -> Result<MultiplexedConnection, RedisError> {
    let client = redis::Client::open(url)?;
    client.get_multiplexed_async_connection().await
}

fn url(port: u16) -> String {
    format!("redis://127.0.0.1:{}/", port)
}

async fn info_field(conn: &mut MultiplexedConnection, section: &str, field: &str) -> u64 {
    let info: String = redis::cmd("INFO")
        .arg(section)
        .query_async(conn)
        .await
        .unwrap();

    info.lines()
        .find_map(|line| line.strip_prefix(&format!("{}:", field)))
        .and_then(|value| value.trim().parse().ok())
        .unwrap()
}

#[tokio::test]
#[serial]
async fn test_strings_and_lists() {
    start(6401, &["--proactor_threads", "4"]).await;
    let mut conn = connect(&url(6401)).await.unwrap();

    let (set, get, incr, append, strlen, kind): (String, String, i64, i64, i64, String) =
        redis::pipe()
            .cmd("SET")
            .arg("name")
            .arg("shard")
            .cmd("GET")
            .arg("name")
            .cmd("INCRBY")
            .arg("counter")
            .arg(5)
            .cmd("APPEND")
            .arg("name")
            .arg("is")
            .cmd("STRLEN")
            .arg("name")
            .cmd("TYPE")
            .arg("counter")
            .query_async(&mut conn)
            .await
            .unwrap();

    assert_eq!(set, "OK");
    assert_eq!(get, "shard");
    assert_eq!(incr, 5);
    assert_eq!(append, 7);
    assert_eq!(strlen, 7);
    assert_eq!(kind, "string");

    let (pushed, range, popped, len): (i64, Vec<String>, String, i64) = redis::pipe()
        .cmd("RPUSH")
        .arg("list")
        .arg("a")
        .arg("b")
        .arg("c")
        .cmd("LRANGE")
        .arg("list")
        .arg(0)
        .arg(-1)
        .cmd("LPOP")
        .arg("list")
        .cmd("LLEN")
        .arg("list")
        .query_async(&mut conn)
        .await
        .unwrap();

    assert_eq!(pushed, 3);
    assert_eq!(range, vec!["a", "b", "c"]);
    assert_eq!(popped, "a");
    assert_eq!(len, 2);

    let err = redis::cmd("INCR")
        .arg("list")
        .query_async::<_, i64>(&mut conn)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("WRONGTYPE"));
}

#[tokio::test]
#[serial]
async fn test_multi_shard_commands() {
    start(6402, &["--proactor_threads", "4"]).await;
    let mut conn = connect(&url(6402)).await.unwrap();

    let keys: Vec<String> = (0..32).map(|i| format!("key:{}", i)).collect();
    let pairs: Vec<(String, String)> = keys
        .iter()
        .map(|k| (k.clone(), format!("v-{}", k)))
        .collect();

    let _: () = redis::cmd("MSET")
        .arg(&pairs)
        .query_async(&mut conn)
        .await
        .unwrap();

    let values: Vec<Option<String>> = redis::cmd("MGET")
        .arg(&keys)
        .arg("missing")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(values.len(), 33);
    assert_eq!(values[0].as_deref(), Some("v-key:0"));
    assert_eq!(values[31].as_deref(), Some("v-key:31"));
    assert_eq!(values[32], None);

    let exists: i64 = redis::cmd("EXISTS")
        .arg(&keys)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(exists, 32);

    let dbsize: i64 = redis::cmd("DBSIZE").query_async(&mut conn).await.unwrap();
    assert_eq!(dbsize, 32);

    let mut found: Vec<String> = redis::cmd("KEYS")
        .arg("key:*")
        .query_async(&mut conn)
        .await
        .unwrap();
    found.sort();
    let mut expected = keys.clone();
    expected.sort();
    assert_eq!(found, expected);

    let deleted: i64 = redis::cmd("DEL")
        .arg(&keys[..10])
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(deleted, 10);

    let _: () = redis::cmd("FLUSHALL").query_async(&mut conn).await.unwrap();
    let dbsize: i64 = redis::cmd("DBSIZE").query_async(&mut conn).await.unwrap();
    assert_eq!(dbsize, 0);
}

#[tokio::test]
#[serial]
async fn test_keys_output_limit() {
    start(6403, &["--proactor_threads", "2", "--keys_output_limit", "512"]).await;
    let mut conn = connect(&url(6403)).await.unwrap();

    let _: () = redis::cmd("DEBUG")
        .arg("POPULATE")
        .arg(2000)
        .query_async(&mut conn)
        .await
        .unwrap();

    let keys: Vec<String> = redis::cmd("KEYS")
        .arg("*")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(keys.len() >= 512 && keys.len() < 1024, "got {} keys", keys.len());
}

#[tokio::test]
#[serial]
async fn test_requirepass_from_environment() {
    std::env::set_var("SHARDIS_REQUIREPASS", "s3cret");
    start(6404, &[]).await;
    std::env::remove_var("SHARDIS_REQUIREPASS");

    let mut anonymous = connect(&url(6404)).await.unwrap();
    let err = redis::cmd("GET")
        .arg("a")
        .query_async::<_, Option<String>>(&mut anonymous)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("NOAUTH"));

    let mut conn = connect("redis://:s3cret@127.0.0.1:6404/").await.unwrap();
    let pong: String = redis::cmd("PING").query_async(&mut conn).await.unwrap();
    assert_eq!(pong, "PONG");

    assert!(connect("redis://:wrong@127.0.0.1:6404/").await.is_err());
}

#[tokio::test]
#[serial]
async fn test_requirepass_flag_overrides_environment() {
    std::env::set_var("SHARDIS_REQUIREPASS", "from-env");
    start(6412, &["--requirepass", "from-flag"]).await;
    std::env::remove_var("SHARDIS_REQUIREPASS");

    assert!(connect("redis://:from-env@127.0.0.1:6412/").await.is_err());

    let mut conn = connect("redis://:from-flag@127.0.0.1:6412/").await.unwrap();
    let pong: String = redis::cmd("PING").query_async(&mut conn).await.unwrap();
    assert_eq!(pong, "PONG");
}

#[tokio::test]
#[serial]
async fn test_restricted_commands_and_admin_port() {
    start(
        6405,
        &["--admin_port", "6406", "--restricted_commands", "flushdb,debug"],
    )
    .await;
    let mut main = connect(&url(6405)).await.unwrap();
    let mut admin = connect(&url(6406)).await.unwrap();

    let _: () = redis::cmd("SET")
        .arg("a")
        .arg("1")
        .query_async(&mut main)
        .await
        .unwrap();

    let err = redis::cmd("FLUSHDB")
        .query_async::<_, ()>(&mut main)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("NOPERM"));

    let value: Option<String> = redis::cmd("GET")
        .arg("a")
        .query_async(&mut admin)
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("1"));

    let _: () = redis::cmd("FLUSHDB").query_async(&mut admin).await.unwrap();
    let value: Option<String> = redis::cmd("GET")
        .arg("a")
        .query_async(&mut main)
        .await
        .unwrap();
    assert_eq!(value, None);
}

#[tokio::test]
#[serial]
async fn test_multi_incr_is_not_interleaved() {
    start(6407, &["--proactor_threads", "4"]).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let mut conn = connect(&url(6407)).await.unwrap();
        handles.push(tokio::spawn(async move {
            let mut results = Vec::new();
            for _ in 0..5 {
                let mut pipe = redis::pipe();
                pipe.atomic();
                for _ in 0..10 {
                    pipe.cmd("INCR").arg("counter").cmd("INCR").arg("other");
                }
                let values: Vec<i64> = pipe.query_async(&mut conn).await.unwrap();
                results.push(values);
            }
            results
        }));
    }

    for handle in handles {
        for values in handle.await.unwrap() {
            let counter: Vec<i64> = values.iter().step_by(2).copied().collect();
            let first = counter[0];
            assert_eq!(counter, (first..first + 10).collect::<Vec<_>>());
        }
    }

    let mut conn = connect(&url(6407)).await.unwrap();
    let total: i64 = redis::cmd("GET")
        .arg("counter")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(total, 200);
}

#[tokio::test]
#[serial]
async fn test_transactions_race_blocking_pops() {
    start(6413, &["--proactor_threads", "1"]).await;

    let mut handles = Vec::new();
    for (key, workers) in [("i1", 3), ("i2", 4)] {
        for _ in 0..workers {
            let mut conn = connect(&url(6413)).await.unwrap();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    for _ in 0..10 {
                        pipe.cmd("INCR").arg(key);
                    }
                    let values: Vec<i64> = pipe.query_async(&mut conn).await.unwrap();
                    assert_eq!(values.len(), 10);
                }
            }));
        }
    }

    let mut popper = connect(&url(6413)).await.unwrap();
    let pops = tokio::spawn(async move {
        for _ in 0..100 {
            let (pushed, popped, missed): (i64, (String, String), Option<(String, String)>) =
                redis::pipe()
                    .cmd("LPUSH")
                    .arg("l1")
                    .arg("x")
                    .cmd("BLPOP")
                    .arg("l1")
                    .arg(0.001)
                    .cmd("BLPOP")
                    .arg("l2")
                    .arg(0.001)
                    .query_async(&mut popper)
                    .await
                    .unwrap();
            assert_eq!(pushed, 1);
            assert_eq!(popped, ("l1".to_string(), "x".to_string()));
            assert_eq!(missed, None);
        }
    });

    for handle in handles {
        handle.await.unwrap();
    }
    pops.await.unwrap();

    let mut conn = connect(&url(6413)).await.unwrap();
    let (i1, i2, len): (i64, i64, i64) = redis::pipe()
        .cmd("GET")
        .arg("i1")
        .cmd("GET")
        .arg("i2")
        .cmd("LLEN")
        .arg("l1")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(i1, 300);
    assert_eq!(i2, 400);
    assert_eq!(len, 0);
}

#[tokio::test]
#[serial]
async fn test_blpop_woken_by_push() {
    start(6408, &["--proactor_threads", "2"]).await;
    let mut waiter = connect(&url(6408)).await.unwrap();
    let mut pusher = connect(&url(6408)).await.unwrap();

    let blocked = tokio::spawn(async move {
        redis::cmd("BLPOP")
            .arg("empty")
            .arg("jobs")
            .arg(5)
            .query_async::<_, Option<(String, String)>>(&mut waiter)
            .await
    });

    sleep(Duration::from_millis(100)).await;
    let _: i64 = redis::cmd("RPUSH")
        .arg("jobs")
        .arg("job-1")
        .query_async(&mut pusher)
        .await
        .unwrap();

    let popped = blocked.await.unwrap().unwrap();
    assert_eq!(popped, Some(("jobs".to_string(), "job-1".to_string())));

    let len: i64 = redis::cmd("LLEN")
        .arg("jobs")
        .query_async(&mut pusher)
        .await
        .unwrap();
    assert_eq!(len, 0);
}

#[tokio::test]
#[serial]
async fn test_blpop_times_out() {
    start(6409, &[]).await;
    let mut conn = connect(&url(6409)).await.unwrap();

    let started = Instant::now();
    let popped: Option<(String, String)> = redis::cmd("BLPOP")
        .arg("nothing")
        .arg(0.2)
        .query_async(&mut conn)
        .await
        .unwrap();

    assert_eq!(popped, None);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
#[serial]
async fn test_cache_mode_evicts() {
    start(
        6410,
        &["--proactor_threads", "2", "--maxmemory", "256kb", "--cache_mode", "true"],
    )
    .await;
    let mut conn = connect(&url(6410)).await.unwrap();

    let _: () = redis::cmd("DEBUG")
        .arg("POPULATE")
        .arg(5000)
        .arg("key")
        .arg(128)
        .query_async(&mut conn)
        .await
        .unwrap();

    assert!(info_field(&mut conn, "stats", "evicted_keys").await > 0);

    let dbsize: i64 = redis::cmd("DBSIZE").query_async(&mut conn).await.unwrap();
    assert!(dbsize < 5000);

    let reply: String = redis::cmd("SET")
        .arg("fresh")
        .arg("value")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(reply, "OK");
}

#[tokio::test]
#[serial]
async fn test_writes_refused_over_maxmemory() {
    start(6411, &["--maxmemory", "64kb"]).await;
    let mut conn = connect(&url(6411)).await.unwrap();

    let value = "x".repeat(512);
    let mut refused = None;
    for i in 0..512 {
        let reply: Result<Value, RedisError> = redis::cmd("SET")
            .arg(format!("key:{}", i))
            .arg(&value)
            .query_async(&mut conn)
            .await;
        if let Err(err) = reply {
            refused = Some(err);
            break;
        }
    }

    let err = refused.expect("a write should have been refused");
    assert_eq!(err.code(), Some("OOM"));

    // Reads and deletes still work.
    let first: Option<String> = redis::cmd("GET")
        .arg("key:0")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(first.as_deref(), Some(value.as_str()));
    let deleted: i64 = redis::cmd("DEL")
        .arg("key:0")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(deleted, 1);
}
