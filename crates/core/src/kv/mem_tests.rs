// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use bytes::Bytes;

use super::*;

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[tokio::test]
async fn put_get_delete() -> anyhow::Result<()> {
    let kv = MemKv::new();
    assert!(kv.get("k").await?.is_none());
    kv.put("k", b("v")).await?;
    assert_eq!(kv.get("k").await?, Some(b("v")));
    kv.delete("k").await?;
    assert!(kv.get("k").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn take_is_single_use() -> anyhow::Result<()> {
    let kv = MemKv::new();
    kv.put("ws_token:abc", b("alice")).await?;
    assert_eq!(kv.take("ws_token:abc").await?, Some(b("alice")));
    assert!(kv.take("ws_token:abc").await?.is_none());
    assert!(kv.get("ws_token:abc").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn ttl_expiry_hides_entries() -> anyhow::Result<()> {
    let kv = MemKv::with_ttl(Duration::from_millis(10));
    kv.put("presence:user:alice", b("on")).await?;
    assert!(kv.get("presence:user:alice").await?.is_some());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(kv.get("presence:user:alice").await?.is_none());
    assert!(kv.keys("presence:").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn write_refreshes_ttl() -> anyhow::Result<()> {
    let kv = MemKv::with_ttl(Duration::from_millis(50));
    kv.put("k", b("1")).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    kv.put("k", b("2")).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;
    // 60 ms after the first write, 30 ms after the refresh.
    assert_eq!(kv.get("k").await?, Some(b("2")));
    Ok(())
}

#[tokio::test]
async fn keys_filters_by_prefix() -> anyhow::Result<()> {
    let kv = MemKv::new();
    kv.put("read-pointer:alice:ch_x", b("1")).await?;
    kv.put("read-pointer:alice:ch_y", b("2")).await?;
    kv.put("unread:alice", b("3")).await?;
    let mut keys = kv.keys("read-pointer:alice:").await?;
    keys.sort();
    assert_eq!(keys, vec!["read-pointer:alice:ch_x", "read-pointer:alice:ch_y"]);
    Ok(())
}

#[tokio::test]
async fn watch_sees_puts_deletes_and_sweeps() -> anyhow::Result<()> {
    let kv = MemKv::with_ttl(Duration::from_millis(10));
    let mut watch = kv.watch("presence:").await?;

    kv.put("presence:user:alice", b("on")).await?;
    let entry = watch.try_recv()?;
    assert_eq!(entry.key, "presence:user:alice");
    assert!(entry.value.is_some());

    kv.put("unrelated:key", b("x")).await?;
    assert!(watch.try_recv().is_err());

    tokio::time::sleep(Duration::from_millis(30)).await;
    kv.sweep().await;
    let entry = watch.try_recv()?;
    assert_eq!(entry.key, "presence:user:alice");
    assert!(entry.value.is_none());
    Ok(())
}
