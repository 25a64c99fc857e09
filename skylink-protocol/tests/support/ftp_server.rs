//! In-process FTP server
//!
//! Scripted against an in-memory file tree, speaking just enough of the
//! dialect the engine uses: USER/PASS login, EPSV data channels, TYPE,
//! SIZE, REST, RETR, STOR, APPE, LIST, DELE, RMD, CWD, RNFR and RNTO.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

/// Shared in-memory file tree
#[derive(Default)]
pub struct FakeFs {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
}

impl FakeFs {
    fn dir_exists(&self, dir: &str) -> bool {
        self.dirs.contains(dir)
            || self
                .files
                .keys()
                .any(|k| k.starts_with(&format!("{}/", dir.trim_end_matches('/'))))
    }
}

pub struct FakeFtpServer {
    pub port: u16,
    pub fs: Arc<Mutex<FakeFs>>,
}

impl FakeFtpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let fs: Arc<Mutex<FakeFs>> = Arc::default();

        let fs_accept = fs.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_control(stream, fs_accept.clone()));
            }
        });
        Self { port, fs }
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut fs = self.fs.lock().unwrap();
        register_ancestors(&mut fs, path);
        fs.files.insert(path.to_string(), data.to_vec());
    }

    pub fn add_dir(&self, path: &str) {
        self.fs.lock().unwrap().dirs.insert(path.to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.lock().unwrap().files.get(path).cloned()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.fs.lock().unwrap().files.contains_key(path)
    }
}

async fn reply(writer: &mut OwnedWriteHalf, line: &str) {
    let _ = writer.write_all(format!("{line}\r\n").as_bytes()).await;
}

fn register_ancestors(fs: &mut FakeFs, path: &str) {
    let mut dir = path;
    while let Some(pos) = dir.rfind('/') {
        dir = &dir[..pos];
        if dir.is_empty() {
            break;
        }
        fs.dirs.insert(dir.to_string());
    }
}

fn resolve(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    }
}

async fn serve_control(stream: TcpStream, fs: Arc<Mutex<FakeFs>>) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    reply(&mut writer, "220 fake ftp ready").await;

    let mut cwd = "/".to_string();
    let mut rest_offset: u64 = 0;
    let mut rnfr: Option<String> = None;
    let mut data_listener: Option<TcpListener> = None;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim_end();
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
            None => (line.to_ascii_uppercase(), String::new()),
        };

        match verb.as_str() {
            "USER" => reply(&mut writer, "331 password required").await,
            "PASS" => reply(&mut writer, "230 logged in").await,
            "TYPE" => reply(&mut writer, "200 type set").await,
            "EPSV" => {
                let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
                let port = listener.local_addr().unwrap().port();
                data_listener = Some(listener);
                reply(
                    &mut writer,
                    &format!("229 Entering Extended Passive Mode (|||{port}|)"),
                )
                .await;
            }
            "CWD" => {
                let path = resolve(&cwd, &arg);
                if fs.lock().unwrap().dir_exists(&path) {
                    cwd = path;
                    reply(&mut writer, "250 cwd ok").await;
                } else {
                    reply(&mut writer, "550 no such directory").await;
                }
            }
            "SIZE" => {
                let path = resolve(&cwd, &arg);
                let size = fs.lock().unwrap().files.get(&path).map(Vec::len);
                match size {
                    Some(size) => reply(&mut writer, &format!("213 {size}")).await,
                    None => reply(&mut writer, "550 no such file").await,
                }
            }
            "REST" => {
                rest_offset = arg.parse().unwrap_or(0);
                reply(&mut writer, "350 restarting").await;
            }
            "RETR" => {
                let path = resolve(&cwd, &arg);
                let data = fs.lock().unwrap().files.get(&path).cloned();
                let Some(data) = data else {
                    reply(&mut writer, "550 no such file").await;
                    continue;
                };
                let Some(listener) = data_listener.take() else {
                    reply(&mut writer, "425 no data connection").await;
                    continue;
                };
                reply(&mut writer, "150 opening data connection").await;
                if let Ok((mut data_stream, _)) = listener.accept().await {
                    let offset = (rest_offset as usize).min(data.len());
                    let _ = data_stream.write_all(&data[offset..]).await;
                    let _ = data_stream.shutdown().await;
                }
                rest_offset = 0;
                reply(&mut writer, "226 transfer complete").await;
            }
            "STOR" | "APPE" => {
                let path = resolve(&cwd, &arg);
                let Some(listener) = data_listener.take() else {
                    reply(&mut writer, "425 no data connection").await;
                    continue;
                };
                reply(&mut writer, "150 opening data connection").await;
                let mut received = Vec::new();
                if let Ok((mut data_stream, _)) = listener.accept().await {
                    let _ = data_stream.read_to_end(&mut received).await;
                }
                {
                    let mut fs = fs.lock().unwrap();
                    register_ancestors(&mut fs, &path);
                    if verb == "APPE" {
                        let entry = fs.files.entry(path).or_default();
                        entry.truncate(rest_offset as usize);
                        entry.extend_from_slice(&received);
                    } else {
                        fs.files.insert(path, received);
                    }
                }
                rest_offset = 0;
                reply(&mut writer, "226 transfer complete").await;
            }
            "LIST" => {
                let path = resolve(&cwd, if arg.is_empty() { "." } else { &arg });
                let Some(listener) = data_listener.take() else {
                    reply(&mut writer, "425 no data connection").await;
                    continue;
                };
                reply(&mut writer, "150 opening data connection").await;
                let listing = build_listing(&fs, &path);
                if let Ok((mut data_stream, _)) = listener.accept().await {
                    let _ = data_stream.write_all(listing.as_bytes()).await;
                    let _ = data_stream.shutdown().await;
                }
                reply(&mut writer, "226 transfer complete").await;
            }
            "DELE" => {
                let path = resolve(&cwd, &arg);
                if fs.lock().unwrap().files.remove(&path).is_some() {
                    reply(&mut writer, "250 deleted").await;
                } else {
                    reply(&mut writer, "550 no such file").await;
                }
            }
            "RMD" => {
                let path = resolve(&cwd, &arg);
                let (removed, had_children) = {
                    let mut fs = fs.lock().unwrap();
                    let removed = fs.dirs.remove(&path);
                    let prefix = format!("{}/", path.trim_end_matches('/'));
                    let doomed: Vec<String> = fs
                        .files
                        .keys()
                        .filter(|k| k.starts_with(&prefix))
                        .cloned()
                        .collect();
                    let had_children = !doomed.is_empty();
                    for key in doomed {
                        fs.files.remove(&key);
                    }
                    (removed, had_children)
                };
                if removed || had_children {
                    reply(&mut writer, "250 removed").await;
                } else {
                    reply(&mut writer, "550 no such directory").await;
                }
            }
            "RNFR" => {
                let path = resolve(&cwd, &arg);
                if fs.lock().unwrap().files.contains_key(&path) {
                    rnfr = Some(path);
                    reply(&mut writer, "350 ready for rnto").await;
                } else {
                    reply(&mut writer, "550 no such file").await;
                }
            }
            "RNTO" => {
                let dst = resolve(&cwd, &arg);
                match rnfr.take() {
                    Some(src) => {
                        let renamed = {
                            let mut fs = fs.lock().unwrap();
                            if let Some(data) = fs.files.remove(&src) {
                                fs.files.insert(dst, data);
                                true
                            } else {
                                false
                            }
                        };
                        if renamed {
                            reply(&mut writer, "250 renamed").await;
                        } else {
                            reply(&mut writer, "550 rename failed").await;
                        }
                    }
                    None => reply(&mut writer, "503 rnfr first").await,
                }
            }
            _ => reply(&mut writer, "502 not implemented").await,
        }
    }
}

/// UNIX `ls -l` style listing of one directory
fn build_listing(fs: &Arc<Mutex<FakeFs>>, dir: &str) -> String {
    let fs = fs.lock().unwrap();
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    let mut lines = vec!["total 1".to_string()];
    let mut subdirs = BTreeSet::new();

    for (path, data) in &fs.files {
        let Some(rest) = path.strip_prefix(&prefix) else {
            continue;
        };
        match rest.split_once('/') {
            None => lines.push(format!(
                "-rw-r--r-- 1 0 0 {} Jan 01 00:00 {}",
                data.len(),
                rest
            )),
            Some((sub, _)) => {
                subdirs.insert(sub.to_string());
            }
        }
    }
    for dir in &fs.dirs {
        if let Some(rest) = dir.strip_prefix(&prefix) {
            if !rest.is_empty() && !rest.contains('/') {
                subdirs.insert(rest.to_string());
            }
        }
    }
    for sub in subdirs {
        lines.push(format!("drwxr-xr-x 2 0 0 4096 Jan 01 00:00 {sub}"));
    }
    lines.join("\r\n") + "\r\n"
}
