// =============================================================================
// Helios — RAM Filesystem
// =============================================================================
//
// A fixed-capacity in-memory filesystem implementing the provider
// contract: a flat node table forming a tree through parent indices,
// per-node data storage, and a small open-file table. It backs the
// syscall layer at boot (there is no disk driver in the core) and gives
// the contract's round-trip laws something real to run against.
//
// Capacities are deliberately small and static: 64 nodes, 8 KiB per
// file, 16 simultaneous open files. Inode numbers are node index + 1 so
// 0 remains the "not found" value of `lookup_path`.
//
// =============================================================================

use crate::fs::{
    self, DirEntry, FIRST_PROVIDER_FD, FileSystem, FsError, O_CREAT, O_TRUNC, S_IFDIR,
    S_IFREG, Stat, Whence,
};
use crate::sync::SpinLock;

const MAX_NODES: usize = 64;
const MAX_NAME: usize = 28;
const MAX_FILE_SIZE: usize = 8 * 1024;
const MAX_OPEN: usize = 16;
/// Deepest path the cwd reconstruction will walk.
const MAX_DEPTH: usize = 16;

const ROOT: usize = 0;

struct Node {
    used: bool,
    is_dir: bool,
    name: [u8; MAX_NAME],
    name_len: usize,
    parent: usize,
    size: usize,
    data: [u8; MAX_FILE_SIZE],
}

impl Node {
    const fn empty() -> Self {
        Self {
            used: false,
            is_dir: false,
            name: [0; MAX_NAME],
            name_len: 0,
            parent: ROOT,
            size: 0,
            data: [0; MAX_FILE_SIZE],
        }
    }

    fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("")
    }
}

#[derive(Clone, Copy)]
struct OpenFile {
    node: usize,
    pos: u64,
    #[allow(dead_code)]
    flags: u32,
}

struct RamfsInner {
    nodes: [Node; MAX_NODES],
    open: [Option<OpenFile>; MAX_OPEN],
    cwd: usize,
    initialized: bool,
}

impl RamfsInner {
    const fn new() -> Self {
        Self {
            nodes: [const { Node::empty() }; MAX_NODES],
            open: [None; MAX_OPEN],
            cwd: ROOT,
            initialized: false,
        }
    }

    fn ensure_root(&mut self) {
        if !self.initialized {
            self.nodes[ROOT].used = true;
            self.nodes[ROOT].is_dir = true;
            self.nodes[ROOT].parent = ROOT;
            self.initialized = true;
        }
    }

    // -------------------------------------------------------------------------
    // Node and path plumbing
    // -------------------------------------------------------------------------

    fn alloc_node(&mut self) -> Option<usize> {
        self.nodes.iter().position(|n| !n.used)
    }

    fn find_child(&self, dir: usize, name: &str) -> Option<usize> {
        (0..MAX_NODES).find(|&i| {
            i != ROOT
                && self.nodes[i].used
                && self.nodes[i].parent == dir
                && self.nodes[i].name_str() == name
        })
    }

    fn has_children(&self, dir: usize) -> bool {
        (0..MAX_NODES)
            .any(|i| i != ROOT && self.nodes[i].used && self.nodes[i].parent == dir)
    }

    /// Resolves `path` to a node index, starting from the root for
    /// absolute paths and from the cwd otherwise.
    fn resolve(&self, path: &str) -> Result<usize, FsError> {
        let mut node = if path.starts_with('/') { ROOT } else { self.cwd };
        for part in path.split('/') {
            match part {
                "" | "." => continue,
                ".." => node = self.nodes[node].parent,
                name => {
                    if !self.nodes[node].is_dir {
                        return Err(FsError::NotADirectory);
                    }
                    node = self.find_child(node, name).ok_or(FsError::NotFound)?;
                }
            }
        }
        Ok(node)
    }

    /// Resolves the directory containing `path`'s last component, which
    /// is returned alongside it.
    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(usize, &'p str), FsError> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::InvalidPath);
        }
        let (dir_part, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => (".", trimmed),
        };
        if name.is_empty() || name == "." || name == ".." || name.len() >= MAX_NAME {
            return Err(FsError::InvalidPath);
        }
        let dir = self.resolve(dir_part)?;
        if !self.nodes[dir].is_dir {
            return Err(FsError::NotADirectory);
        }
        Ok((dir, name))
    }

    fn create_node(&mut self, dir: usize, name: &str, is_dir: bool) -> Result<usize, FsError> {
        if self.find_child(dir, name).is_some() {
            return Err(FsError::Exists);
        }
        let idx = self.alloc_node().ok_or(FsError::NoSpace)?;
        let node = &mut self.nodes[idx];
        node.used = true;
        node.is_dir = is_dir;
        node.parent = dir;
        node.name[..name.len()].copy_from_slice(name.as_bytes());
        node.name_len = name.len();
        node.size = 0;
        Ok(idx)
    }

    fn handle(&self, fd: i32) -> Result<OpenFile, FsError> {
        let idx = fd - FIRST_PROVIDER_FD;
        if !(0..MAX_OPEN as i32).contains(&idx) {
            return Err(FsError::BadDescriptor);
        }
        self.open[idx as usize].ok_or(FsError::BadDescriptor)
    }

    fn handle_mut(&mut self, fd: i32) -> Result<&mut OpenFile, FsError> {
        let idx = fd - FIRST_PROVIDER_FD;
        if !(0..MAX_OPEN as i32).contains(&idx) {
            return Err(FsError::BadDescriptor);
        }
        self.open[idx as usize].as_mut().ok_or(FsError::BadDescriptor)
    }
}

/// The provider: all state behind one lock.
pub struct Ramfs {
    inner: SpinLock<RamfsInner>,
}

static RAMFS: Ramfs = Ramfs {
    inner: SpinLock::new(RamfsInner::new()),
};

/// Registers the ramfs as the system's filesystem provider and seeds a
/// few familiar paths.
pub fn init() {
    {
        let mut inner = RAMFS.inner.lock();
        inner.ensure_root();
        if inner.find_child(ROOT, "etc").is_none() {
            if let Ok(etc) = inner.create_node(ROOT, "etc", true)
                && let Ok(motd) = inner.create_node(etc, "motd", false)
            {
                let text = b"Helios booted.\n";
                inner.nodes[motd].data[..text.len()].copy_from_slice(text);
                inner.nodes[motd].size = text.len();
            }
            let _ = inner.create_node(ROOT, "tmp", true);
        }
    }
    fs::register_provider(&RAMFS);
    log::info!("ramfs registered ({} nodes, {} KiB per file)", MAX_NODES, MAX_FILE_SIZE / 1024);
}

impl FileSystem for Ramfs {
    fn open(&self, path: &str, flags: u32) -> Result<i32, FsError> {
        let mut inner = self.inner.lock();
        inner.ensure_root();

        let node = match inner.resolve(path) {
            Ok(node) => {
                if !inner.nodes[node].is_dir && flags & O_TRUNC != 0 {
                    inner.nodes[node].size = 0;
                }
                node
            }
            Err(FsError::NotFound) if flags & O_CREAT != 0 => {
                let (dir, name) = inner.resolve_parent(path)?;
                inner.create_node(dir, name, false)?
            }
            Err(e) => return Err(e),
        };

        let slot = inner
            .open
            .iter()
            .position(|o| o.is_none())
            .ok_or(FsError::NoSpace)?;
        inner.open[slot] = Some(OpenFile {
            node,
            pos: 0,
            flags,
        });
        Ok(slot as i32 + FIRST_PROVIDER_FD)
    }

    fn close(&self, fd: i32) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let idx = fd - FIRST_PROVIDER_FD;
        if !(0..MAX_OPEN as i32).contains(&idx) || inner.open[idx as usize].is_none() {
            return Err(FsError::BadDescriptor);
        }
        inner.open[idx as usize] = None;
        Ok(())
    }

    fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut inner = self.inner.lock();
        let handle = inner.handle(fd)?;
        let node = &inner.nodes[handle.node];
        if node.is_dir {
            return Err(FsError::IsADirectory);
        }
        let pos = handle.pos as usize;
        if pos >= node.size {
            return Ok(0);
        }
        let n = buf.len().min(node.size - pos);
        buf[..n].copy_from_slice(&node.data[pos..pos + n]);
        inner.handle_mut(fd)?.pos += n as u64;
        Ok(n)
    }

    fn write(&self, fd: i32, buf: &[u8]) -> Result<usize, FsError> {
        let mut inner = self.inner.lock();
        let handle = inner.handle(fd)?;
        if inner.nodes[handle.node].is_dir {
            return Err(FsError::IsADirectory);
        }
        let pos = handle.pos as usize;
        if pos >= MAX_FILE_SIZE {
            return Err(FsError::NoSpace);
        }
        let n = buf.len().min(MAX_FILE_SIZE - pos);
        if n == 0 {
            return Ok(0);
        }
        let node = handle.node;
        inner.nodes[node].data[pos..pos + n].copy_from_slice(&buf[..n]);
        inner.nodes[node].size = inner.nodes[node].size.max(pos + n);
        inner.handle_mut(fd)?.pos += n as u64;
        Ok(n)
    }

    fn lseek(&self, fd: i32, offset: i64, whence: Whence) -> Result<u64, FsError> {
        let mut inner = self.inner.lock();
        let handle = inner.handle(fd)?;
        let size = inner.nodes[handle.node].size as i64;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => handle.pos as i64,
            Whence::End => size,
        };
        let target = base.checked_add(offset).ok_or(FsError::InvalidPath)?;
        if target < 0 {
            return Err(FsError::InvalidPath);
        }
        inner.handle_mut(fd)?.pos = target as u64;
        Ok(target as u64)
    }

    fn fstat(&self, fd: i32) -> Result<Stat, FsError> {
        let inner = self.inner.lock();
        let handle = inner.handle(fd)?;
        let node = &inner.nodes[handle.node];
        Ok(Stat {
            st_ino: handle.node as u64 + 1,
            st_size: node.size as u64,
            st_blocks: (node.size as u64).div_ceil(512),
            st_mode: if node.is_dir {
                S_IFDIR | 0o755
            } else {
                S_IFREG | 0o644
            },
            st_blksize: 4096,
        })
    }

    fn read_dir(&self, fd: i32, index: usize) -> Result<Option<DirEntry>, FsError> {
        let inner = self.inner.lock();
        let handle = inner.handle(fd)?;
        if !inner.nodes[handle.node].is_dir {
            return Err(FsError::NotADirectory);
        }
        let mut seen = 0;
        for i in 0..MAX_NODES {
            if i == ROOT || !inner.nodes[i].used || inner.nodes[i].parent != handle.node {
                continue;
            }
            if seen == index {
                let node = &inner.nodes[i];
                let mut name = [0u8; 60];
                let len = node.name_len.min(name.len() - 1);
                name[..len].copy_from_slice(&node.name[..len]);
                return Ok(Some(DirEntry {
                    ino: i as u64 + 1,
                    name,
                    name_len: len,
                    is_dir: node.is_dir,
                }));
            }
            seen += 1;
        }
        Ok(None)
    }

    fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        inner.ensure_root();
        let (dir, name) = inner.resolve_parent(path)?;
        inner.create_node(dir, name, true).map(|_| ())
    }

    fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let node = inner.resolve(path)?;
        if node == ROOT {
            return Err(FsError::InvalidPath);
        }
        if !inner.nodes[node].is_dir {
            return Err(FsError::NotADirectory);
        }
        if inner.has_children(node) {
            return Err(FsError::NotEmpty);
        }
        if inner.cwd == node {
            return Err(FsError::InvalidPath);
        }
        inner.nodes[node] = Node::empty();
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let node = inner.resolve(path)?;
        if inner.nodes[node].is_dir {
            return Err(FsError::IsADirectory);
        }
        // Any open descriptor on the node goes stale with it.
        for slot in inner.open.iter_mut() {
            if let Some(o) = slot
                && o.node == node
            {
                *slot = None;
            }
        }
        inner.nodes[node] = Node::empty();
        Ok(())
    }

    fn chdir(&self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        inner.ensure_root();
        let node = inner.resolve(path)?;
        if !inner.nodes[node].is_dir {
            return Err(FsError::NotADirectory);
        }
        inner.cwd = node;
        Ok(())
    }

    fn getcwd(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        let inner = self.inner.lock();
        if inner.cwd == ROOT {
            if buf.is_empty() {
                return Err(FsError::NoSpace);
            }
            buf[0] = b'/';
            return Ok(1);
        }

        // Collect the component chain up to the root, then emit it
        // top-down.
        let mut chain = [0usize; MAX_DEPTH];
        let mut depth = 0;
        let mut node = inner.cwd;
        while node != ROOT {
            if depth == MAX_DEPTH {
                return Err(FsError::InvalidPath);
            }
            chain[depth] = node;
            depth += 1;
            node = inner.nodes[node].parent;
        }

        let mut written = 0;
        for i in (0..depth).rev() {
            let name = &inner.nodes[chain[i]].name[..inner.nodes[chain[i]].name_len];
            if written + 1 + name.len() > buf.len() {
                return Err(FsError::NoSpace);
            }
            buf[written] = b'/';
            written += 1;
            buf[written..written + name.len()].copy_from_slice(name);
            written += name.len();
        }
        Ok(written)
    }

    fn lookup_path(&self, path: &str) -> Option<u32> {
        let inner = self.inner.lock();
        inner.resolve(path).ok().map(|idx| idx as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_handle() -> &'static Ramfs {
        init();
        &RAMFS
    }

    #[test]
    fn write_seek_read_round_trip() {
        let fs = fs_handle();
        let fd = fs.open("/rt.txt", O_CREAT | 3).unwrap();

        let payload = b"the quick brown fox";
        assert_eq!(fs.write(fd, payload).unwrap(), payload.len());
        assert_eq!(fs.lseek(fd, 0, Whence::Set).unwrap(), 0);

        let mut back = [0u8; 19];
        assert_eq!(fs.read(fd, &mut back).unwrap(), payload.len());
        assert_eq!(&back, payload);

        // Reading past the end returns 0.
        assert_eq!(fs.read(fd, &mut back).unwrap(), 0);
        fs.close(fd).unwrap();
        fs.unlink("/rt.txt").unwrap();
    }

    #[test]
    fn open_missing_fails_creat_creates() {
        let fs = fs_handle();
        assert_eq!(fs.open("/nope.txt", 1), Err(FsError::NotFound));

        let fd = fs.open("/made.txt", O_CREAT | 2).unwrap();
        fs.close(fd).unwrap();
        assert!(fs.lookup_path("/made.txt").is_some());
        fs.unlink("/made.txt").unwrap();
        assert_eq!(fs.lookup_path("/made.txt"), None);
    }

    #[test]
    fn truncate_resets_size() {
        let fs = fs_handle();
        let fd = fs.open("/trunc.txt", O_CREAT | 3).unwrap();
        fs.write(fd, b"0123456789").unwrap();
        fs.close(fd).unwrap();

        let fd = fs.open("/trunc.txt", 3 | O_TRUNC).unwrap();
        assert_eq!(fs.fstat(fd).unwrap().st_size, 0);
        fs.close(fd).unwrap();
        fs.unlink("/trunc.txt").unwrap();
    }

    #[test]
    fn lseek_whence_semantics() {
        let fs = fs_handle();
        let fd = fs.open("/seek.txt", O_CREAT | 3).unwrap();
        fs.write(fd, b"abcdef").unwrap();

        assert_eq!(fs.lseek(fd, 2, Whence::Set).unwrap(), 2);
        assert_eq!(fs.lseek(fd, 1, Whence::Cur).unwrap(), 3);
        assert_eq!(fs.lseek(fd, -1, Whence::End).unwrap(), 5);
        assert!(fs.lseek(fd, -10, Whence::Set).is_err());

        let mut one = [0u8; 1];
        fs.lseek(fd, 5, Whence::Set).unwrap();
        fs.read(fd, &mut one).unwrap();
        assert_eq!(&one, b"f");

        fs.close(fd).unwrap();
        fs.unlink("/seek.txt").unwrap();
    }

    #[test]
    fn directory_lifecycle() {
        let fs = fs_handle();
        fs.mkdir("/dl").unwrap();
        fs.mkdir("/dl/sub").unwrap();
        assert_eq!(fs.mkdir("/dl"), Err(FsError::Exists));

        // A populated directory refuses rmdir.
        assert_eq!(fs.rmdir("/dl"), Err(FsError::NotEmpty));

        let fd = fs.open("/dl/file", O_CREAT | 2).unwrap();
        fs.close(fd).unwrap();

        // Enumerate children through read_dir.
        let dirfd = fs.open("/dl", 1).unwrap();
        let mut names = Vec::new();
        let mut idx = 0;
        while let Some(e) = fs.read_dir(dirfd, idx).unwrap() {
            names.push(String::from_utf8_lossy(&e.name[..e.name_len]).into_owned());
            idx += 1;
        }
        fs.close(dirfd).unwrap();
        names.sort();
        assert_eq!(names, vec!["file", "sub"]);

        fs.unlink("/dl/file").unwrap();
        fs.rmdir("/dl/sub").unwrap();
        fs.rmdir("/dl").unwrap();
        assert_eq!(fs.lookup_path("/dl"), None);
    }

    #[test]
    fn relative_paths_and_dotdot() {
        let fs = fs_handle();
        fs.mkdir("/rel").unwrap();
        fs.mkdir("/rel/in").unwrap();

        // Resolution handles ".." and "." without touching the cwd.
        assert_eq!(
            fs.lookup_path("/rel/in/../in/./."),
            fs.lookup_path("/rel/in")
        );

        fs.rmdir("/rel/in").unwrap();
        fs.rmdir("/rel").unwrap();
    }

    #[test]
    fn stat_reports_mode_and_blocks() {
        let fs = fs_handle();
        let fd = fs.open("/st.bin", O_CREAT | 3).unwrap();
        fs.write(fd, &[0u8; 1025]).unwrap();
        let stat = fs.fstat(fd).unwrap();
        assert_eq!(stat.st_mode & S_IFREG, S_IFREG);
        assert_eq!(stat.st_size, 1025);
        assert_eq!(stat.st_blocks, 3); // ceil(1025 / 512)
        fs.close(fd).unwrap();
        fs.unlink("/st.bin").unwrap();

        let dirfd = fs.open("/etc", 1).unwrap();
        assert_eq!(fs.fstat(dirfd).unwrap().st_mode & S_IFDIR, S_IFDIR);
        fs.close(dirfd).unwrap();
    }

    #[test]
    fn file_growth_is_capped() {
        let fs = fs_handle();
        let fd = fs.open("/cap.bin", O_CREAT | 3).unwrap();
        let chunk = [0xABu8; MAX_FILE_SIZE];
        assert_eq!(fs.write(fd, &chunk).unwrap(), MAX_FILE_SIZE);
        assert_eq!(fs.write(fd, b"x"), Err(FsError::NoSpace));
        fs.close(fd).unwrap();
        fs.unlink("/cap.bin").unwrap();
    }
}
