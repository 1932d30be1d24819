//! Real archives produced through the pool, read back with the `zip` crate

use pzip::{
    CompressionMethod, CompressorPool, DirTempFiles, PoolConfig, Request, Result, ShutdownMode,
    ZipArchive,
};
use std::io::{Cursor, Read};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn sample(i: usize) -> Vec<u8> {
    let pattern = format!("entry {} says: the quick brown fox jumps over the lazy dog. ", i);
    pattern.as_bytes().repeat(i * 37 + 1)
}

fn read_back(bytes: Vec<u8>) -> zip::ZipArchive<Cursor<Vec<u8>>> {
    zip::ZipArchive::new(Cursor::new(bytes)).expect("archive should parse")
}

fn entry_bytes(zip: &mut zip::ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Vec<u8> {
    let mut file = zip.by_name(name).expect("entry should exist");
    let mut data = Vec::new();
    file.read_to_end(&mut data).unwrap();
    data
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_builds_readable_archive() -> Result<()> {
    let archive = ZipArchive::from_writer(Vec::new());
    let pool = CompressorPool::new(
        &CancellationToken::new(),
        archive.clone(),
        PoolConfig::default().with_workers(3),
    );

    for i in 0..20 {
        pool.submit(Request::new(format!("dir/file-{}.txt", i), Cursor::new(sample(i))))
            .await
            .unwrap();
    }

    let report = pool.shutdown(ShutdownMode::Drain).await;
    assert!(report.errors.is_empty());
    assert_eq!(report.entries.len(), 20);
    for stats in &report.entries {
        let i: usize = stats
            .name
            .trim_start_matches("dir/file-")
            .trim_end_matches(".txt")
            .parse()
            .unwrap();
        assert_eq!(stats.uncompressed_size, sample(i).len() as u64);
        assert_eq!(stats.crc32, crc32fast::hash(&sample(i)));
    }
    assert_eq!(archive.entry_count().await, 20);

    let mut zip = read_back(archive.finish().await?);
    assert_eq!(zip.len(), 20);
    for i in 0..20 {
        assert_eq!(entry_bytes(&mut zip, &format!("dir/file-{}.txt", i)), sample(i));
    }
    Ok(())
}

#[tokio::test]
async fn test_stored_entries() -> Result<()> {
    let archive = ZipArchive::from_writer_with_method(Vec::new(), CompressionMethod::Stored, 0);
    let pool = CompressorPool::new(&CancellationToken::new(), archive.clone(), PoolConfig::conservative());

    pool.submit(Request::new("one.txt", &b"first entry"[..]))
        .await
        .unwrap();
    pool.submit(Request::new("two.txt", &b"second entry"[..]))
        .await
        .unwrap();
    pool.finish().await.unwrap();

    let mut zip = read_back(archive.finish().await?);
    assert_eq!(zip.len(), 2);
    assert_eq!(entry_bytes(&mut zip, "one.txt"), b"first entry");
    assert_eq!(entry_bytes(&mut zip, "two.txt"), b"second entry");
    Ok(())
}

#[tokio::test]
async fn test_spool_files_are_released() -> Result<()> {
    let spool_dir = tempdir().unwrap();
    let archive =
        ZipArchive::from_writer(Vec::new()).with_tmpfiles(DirTempFiles::new(spool_dir.path()));
    let pool = CompressorPool::new(&CancellationToken::new(), archive.clone(), PoolConfig::default());

    for i in 0..6 {
        pool.submit(Request::new(format!("{}.bin", i), Cursor::new(sample(i))))
            .await
            .unwrap();
    }
    let report = pool.shutdown(ShutdownMode::Drain).await;

    assert!(report.errors.is_empty());
    for stats in &report.entries {
        let spool = stats.tmp_file.as_ref().unwrap();
        assert!(spool.starts_with(spool_dir.path()));
    }
    assert_eq!(std::fs::read_dir(spool_dir.path()).unwrap().count(), 0);

    archive.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_files_in_files_out() -> Result<()> {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, sample(5)).unwrap();
    let zip_path = dir.path().join("out.zip");

    let archive = ZipArchive::create(&zip_path).await?;
    let pool = CompressorPool::new(&CancellationToken::new(), archive.clone(), PoolConfig::default());
    pool.submit(Request::open("input.txt", &input).await?)
        .await
        .unwrap();
    pool.finish().await.unwrap();
    archive.finish().await?;

    let mut zip = read_back(std::fs::read(&zip_path).unwrap());
    assert_eq!(entry_bytes(&mut zip, "input.txt"), sample(5));
    Ok(())
}

#[tokio::test]
async fn test_missing_input_file() {
    let dir = tempdir().unwrap();
    let err = Request::open("nope", dir.path().join("missing")).await.unwrap_err();
    assert!(matches!(err, pzip::PzipError::Io(_)));
}

#[tokio::test]
async fn test_empty_archive() -> Result<()> {
    let archive = ZipArchive::from_writer(Vec::new());
    let pool = CompressorPool::new(&CancellationToken::new(), archive.clone(), PoolConfig::default());
    pool.close().await.unwrap();

    let bytes = archive.finish().await?;
    assert_eq!(bytes.len(), 22);
    assert_eq!(read_back(bytes).len(), 0);
    Ok(())
}
