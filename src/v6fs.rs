// The Sixth Edition on-disk filesystem: superblock, inodes, directories and
// the free chains, read and written directly on a disk image. Binary layout
// per /usr/man/man5/fs.5.

use log::warn;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const BLOCK_SIZE: usize = 512;
pub const INODE_SIZE: usize = 32;
pub const SUPERBLOCK_SIZE: usize = 415;
/// Largest file the large-file layout can hold: 8 indirect blocks of 256
/// data-block numbers each. Anything bigger needs the huge layout, which
/// V6 userland barely uses and this engine does not support.
pub const BIGGEST_NOT_HUGE_SIZE: usize = BLOCK_SIZE * BLOCK_SIZE / 2 * 8;

// High modtime bytes stamped on files this engine creates or syncs.
pub const CREATED_STAMP: u32 = 0x1300_0000;
pub const SYNCED_STAMP: u32 = 0x1500_0000;

const FLAG_ALLOCATED: u16 = 0x8000;
const FLAG_DIR: u16 = 0x4000;
const FLAG_TYPE: u16 = 0x6000;
const FLAG_LARGE: u16 = 0x1000;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("huge files not supported")]
    HugeFile,
    #[error("no free inodes")]
    NoFreeInodes,
    #[error("out of free blocks")]
    NoFreeBlocks,
    #[error("allocated free block number is zero")]
    ZeroFreeBlock,
    #[error("writing to large directories is not supported")]
    DirectoryFull,
    #[error("data is too big to fit into one block")]
    BlockOverflow,
    #[error("block {0} out of range")]
    BadBlock(u32),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("destination exists: {0}")]
    Exists(String),
    #[error("sync: {0}")]
    Sync(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn u16le(d: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([d[o], d[o + 1]])
}

fn u32le(d: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
}

pub struct Superblock {
    pub isize: u16,
    pub fsize: u16,
    pub nfree: u16,
    pub free: [u16; 100],
    pub ninode: u16,
    pub inode: [u16; 100],
    pub flock: u8,
    pub ilock: u8,
    pub fmod: u8,
    pub time: u32,
}

impl Superblock {
    pub fn parse(data: &[u8]) -> Superblock {
        let mut free = [0u16; 100];
        for (i, f) in free.iter_mut().enumerate() {
            *f = u16le(data, 6 + 2 * i);
        }
        let mut inode = [0u16; 100];
        for (i, n) in inode.iter_mut().enumerate() {
            *n = u16le(data, 208 + 2 * i);
        }
        Superblock {
            isize: u16le(data, 0),
            fsize: u16le(data, 2),
            nfree: u16le(data, 4),
            free,
            ninode: u16le(data, 206),
            inode,
            flock: data[408],
            ilock: data[409],
            fmod: data[410],
            time: u32le(data, 411),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SUPERBLOCK_SIZE);
        data.extend_from_slice(&self.isize.to_le_bytes());
        data.extend_from_slice(&self.fsize.to_le_bytes());
        data.extend_from_slice(&self.nfree.to_le_bytes());
        for f in self.free.iter() {
            data.extend_from_slice(&f.to_le_bytes());
        }
        data.extend_from_slice(&self.ninode.to_le_bytes());
        for n in self.inode.iter() {
            data.extend_from_slice(&n.to_le_bytes());
        }
        data.push(self.flock);
        data.push(self.ilock);
        data.push(self.fmod);
        data.extend_from_slice(&self.time.to_le_bytes());
        data
    }
}

#[derive(Debug, Clone)]
pub struct INode {
    pub inum: u16,
    pub flag: u16,
    pub nlinks: u8,
    pub uid: u8,
    pub gid: u8,
    pub size: u32,
    pub addr: [u16; 8],
    pub actime: u32,
    pub modtime: u32,
}

impl INode {
    pub fn parse(data: &[u8]) -> INode {
        INode {
            inum: 0,
            flag: u16le(data, 0),
            nlinks: data[2],
            uid: data[3],
            gid: data[4],
            size: ((data[5] as u32) << 16) + u16le(data, 6) as u32,
            addr: {
                let mut a = [0u16; 8];
                for (i, x) in a.iter_mut().enumerate() {
                    *x = u16le(data, 8 + 2 * i);
                }
                a
            },
            actime: ((u16le(data, 24) as u32) << 16) | u16le(data, 26) as u32,
            modtime: ((u16le(data, 28) as u32) << 16) | u16le(data, 30) as u32,
        }
    }

    /// A fresh allocated regular file with every permission bit set and a
    /// creation-stamped modtime.
    pub fn new_file() -> INode {
        let tt = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0) as u32;
        let stamp = CREATED_STAMP | (tt & 0xFFFFFF);
        INode {
            inum: 0,
            flag: FLAG_ALLOCATED | 0x01FF,
            nlinks: 1,
            uid: 0,
            gid: 0,
            size: 0,
            addr: [0; 8],
            actime: stamp,
            modtime: stamp,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(INODE_SIZE);
        data.extend_from_slice(&self.flag.to_le_bytes());
        data.push(self.nlinks);
        data.push(self.uid);
        data.push(self.gid);
        data.push((self.size >> 16) as u8);
        data.extend_from_slice(&((self.size & 0xFFFF) as u16).to_le_bytes());
        for a in self.addr.iter() {
            data.extend_from_slice(&a.to_le_bytes());
        }
        data.extend_from_slice(&((self.actime >> 16) as u16).to_le_bytes());
        data.extend_from_slice(&((self.actime & 0xFFFF) as u16).to_le_bytes());
        data.extend_from_slice(&((self.modtime >> 16) as u16).to_le_bytes());
        data.extend_from_slice(&((self.modtime & 0xFFFF) as u16).to_le_bytes());
        data
    }

    pub fn set_free(&mut self) {
        self.flag &= 0x7FFF;
    }

    pub fn set_directory(&mut self) {
        self.flag |= FLAG_DIR;
    }

    pub fn set_large(&mut self) {
        self.flag |= FLAG_LARGE;
    }

    pub fn clear_large(&mut self) {
        self.flag &= !FLAG_LARGE;
    }

    pub fn is_allocated(&self) -> bool {
        self.flag & FLAG_ALLOCATED != 0
    }

    pub fn is_dir(&self) -> bool {
        self.flag & FLAG_DIR == FLAG_DIR
    }

    pub fn is_regular_file(&self) -> bool {
        self.flag & FLAG_DIR == 0
    }

    pub fn is_large(&self) -> bool {
        self.flag & FLAG_LARGE != 0
    }

    pub fn node_type(&self) -> u16 {
        (self.flag & FLAG_TYPE) >> 13
    }

    /// The flag word as `sum`-style listing text, e.g. `aF..........RW.`.
    pub fn flags_string(&self) -> String {
        let mut s = String::with_capacity(15);
        s.push(if self.flag & FLAG_ALLOCATED != 0 { 'a' } else { '.' });
        s.push(match self.node_type() {
            0 => 'F',
            1 => 'S',
            2 => 'D',
            _ => 'B',
        });
        s.push(if self.flag & FLAG_LARGE != 0 { 'L' } else { '.' });
        s.push(if self.flag & 0x0800 != 0 { 'U' } else { '.' });
        s.push(if self.flag & 0x0400 != 0 { 'G' } else { '.' });
        for (i, c) in [(0x0100, 'R'), (0x0080, 'W'), (0x0040, 'X'), (0x0020, 'R'), (0x0010, 'W'), (0x0008, 'X'), (0x0004, 'R'), (0x0002, 'W'), (0x0001, 'X')] {
            s.push(if self.flag & i != 0 { c } else { '.' });
        }
        s
    }
}

/// One row of a recursive directory listing.
pub struct TreeEntry {
    pub depth: usize,
    pub name: String,
    pub is_dir: bool,
    pub size: u32,
    pub flags: String,
    pub sum: u16,
    pub nlinks: u8,
    pub modtime: u32,
}

/// The checksum Unix V6's `sum` reports: bytes with the high bit set are
/// sign-extended before the 16-bit add-with-carry.
pub fn sum_file(data: &[u8]) -> u16 {
    let mut s: u32 = 0;
    for &c in data {
        s += if c <= 0x7F { c as u32 } else { c as u32 | 0xFF00 };
        if s > 0xFFFF {
            s = (s + 1) & 0xFFFF;
        }
    }
    s as u16
}

pub struct V6FileSystem {
    pub disk: Vec<u8>,
}

impl V6FileSystem {
    pub fn new(disk: Vec<u8>) -> V6FileSystem {
        V6FileSystem { disk }
    }

    pub fn open(path: &Path) -> Result<V6FileSystem, FsError> {
        Ok(V6FileSystem { disk: fs::read(path)? })
    }

    pub fn read_block(&self, blkn: u32) -> Result<Vec<u8>, FsError> {
        let off = blkn as usize * BLOCK_SIZE;
        if off + BLOCK_SIZE > self.disk.len() {
            return Err(FsError::BadBlock(blkn));
        }
        Ok(self.disk[off..off + BLOCK_SIZE].to_vec())
    }

    pub fn write_block(&mut self, blkn: u32, data: &[u8]) -> Result<(), FsError> {
        if data.len() > BLOCK_SIZE {
            return Err(FsError::BlockOverflow);
        }
        let off = blkn as usize * BLOCK_SIZE;
        if off + BLOCK_SIZE > self.disk.len() {
            return Err(FsError::BadBlock(blkn));
        }
        self.disk[off..off + data.len()].copy_from_slice(data);
        for b in self.disk[off + data.len()..off + BLOCK_SIZE].iter_mut() {
            *b = 0;
        }
        Ok(())
    }

    pub fn read_superblock(&self) -> Result<Superblock, FsError> {
        let data = self.read_block(1)?;
        Ok(Superblock::parse(&data))
    }

    pub fn write_superblock(&mut self, sup: &Superblock) -> Result<(), FsError> {
        self.write_block(1, &sup.serialize())
    }

    pub fn read_i_node(&self, i: u16) -> Result<INode, FsError> {
        let off = BLOCK_SIZE * 2 + (i as usize - 1) * INODE_SIZE;
        if off + INODE_SIZE > self.disk.len() {
            return Err(FsError::BadBlock(i as u32));
        }
        let mut node = INode::parse(&self.disk[off..off + INODE_SIZE]);
        node.inum = i;
        Ok(node)
    }

    pub fn write_i_node(&mut self, node: &INode) -> Result<(), FsError> {
        let off = BLOCK_SIZE * 2 + (node.inum as usize - 1) * INODE_SIZE;
        if off + INODE_SIZE > self.disk.len() {
            return Err(FsError::BadBlock(node.inum as u32));
        }
        self.disk[off..off + INODE_SIZE].copy_from_slice(&node.serialize());
        Ok(())
    }

    /// Every data block of a file in order, stopping at the first zero
    /// entry. With `include_all` the indirect blocks themselves are listed
    /// too (used when freeing).
    pub fn node_blocks(&self, node: &INode, include_all: bool) -> Result<Vec<u16>, FsError> {
        if node.size as usize > BIGGEST_NOT_HUGE_SIZE {
            return Err(FsError::HugeFile);
        }
        let mut out = Vec::new();
        if !node.is_large() {
            for &n in node.addr.iter() {
                if n == 0 {
                    return Ok(out);
                }
                out.push(n);
            }
        } else {
            for &blk in node.addr.iter() {
                if blk == 0 {
                    return Ok(out);
                }
                if include_all {
                    out.push(blk);
                }
                let ind = self.read_block(blk as u32)?;
                for i in 0..BLOCK_SIZE / 2 {
                    let n = u16le(&ind, 2 * i);
                    if n == 0 {
                        return Ok(out);
                    }
                    out.push(n);
                }
            }
        }
        Ok(out)
    }

    pub fn read_file(&self, node: &INode) -> Result<Vec<u8>, FsError> {
        let mut contents = Vec::with_capacity(node.size as usize);
        for n in self.node_blocks(node, false)? {
            contents.extend_from_slice(&self.read_block(n as u32)?);
        }
        contents.truncate(node.size as usize);
        Ok(contents)
    }

    /// Directory records: 16 bytes, a little-endian inode number and a
    /// NUL-padded 14-byte name. Records with inode 0 are holes.
    pub fn list_dir(&self, node: &INode) -> Result<Vec<(u16, String)>, FsError> {
        if !node.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {}", node.inum)));
        }
        let data = self.read_file(node)?;
        let mut files = Vec::new();
        for rec in data.chunks_exact(16) {
            let inum = u16le(rec, 0);
            if inum > 0 {
                let name: Vec<u8> = rec[2..16].iter().copied().take_while(|&c| c != 0).collect();
                files.push((inum, String::from_utf8_lossy(&name).into_owned()));
            }
        }
        Ok(files)
    }

    /// Walk a path from the root (inode 1). A leading `/` restarts at the
    /// root; an unallocated endpoint reads as absent.
    pub fn path_i_node(&self, path: &str) -> Result<Option<INode>, FsError> {
        if path.starts_with('/') {
            return self.path_i_node_from(path.trim_matches('/'), 1);
        }
        self.path_i_node_from(path, 1)
    }

    fn path_i_node_from(&self, path: &str, inum: u16) -> Result<Option<INode>, FsError> {
        let node = self.read_i_node(inum)?;
        if path.is_empty() {
            if node.is_allocated() {
                return Ok(Some(node));
            }
            return Ok(None);
        }
        if node.is_dir() {
            let (name, tail) = match path.find('/') {
                Some(i) => (&path[..i], &path[i + 1..]),
                None => (path, ""),
            };
            for (no, nm) in self.list_dir(&node)? {
                if nm == name {
                    return self.path_i_node_from(tail, no);
                }
            }
        }
        Ok(None)
    }

    pub fn path_exists(&self, path: &str) -> Result<bool, FsError> {
        Ok(self.path_i_node(path)?.is_some())
    }

    /// Pop a block from the superblock cache; an empty cache refills from
    /// the chain block the last pop named.
    pub fn allocate_block(&mut self) -> Result<u16, FsError> {
        let mut sup = self.read_superblock()?;
        if sup.nfree == 0 {
            return Err(FsError::NoFreeBlocks);
        }
        sup.nfree -= 1;
        let blkn = sup.free[sup.nfree as usize];
        if sup.nfree > 0 {
            self.write_superblock(&sup)?;
            if blkn == 0 {
                return Err(FsError::ZeroFreeBlock);
            }
            return Ok(blkn);
        }
        let blk = self.read_block(blkn as u32)?;
        sup.nfree = u16le(&blk, 0);
        for i in 0..100 {
            sup.free[i] = u16le(&blk, 2 + 2 * i);
        }
        self.write_superblock(&sup)?;
        Ok(blkn)
    }

    /// Push a block back; a full cache first spills into the freed block.
    pub fn free_block(&mut self, blkn: u16) -> Result<(), FsError> {
        let mut sup = self.read_superblock()?;
        if sup.nfree >= 100 {
            let mut data = Vec::with_capacity(202);
            data.extend_from_slice(&sup.nfree.to_le_bytes());
            for f in sup.free.iter() {
                data.extend_from_slice(&f.to_le_bytes());
            }
            self.write_block(blkn as u32, &data)?;
            sup.nfree = 0;
        }
        sup.free[sup.nfree as usize] = blkn;
        sup.nfree += 1;
        self.write_superblock(&sup)
    }

    /// Pop an inode from the superblock cache, rescanning the inode table
    /// when the cache is dry. Returns a fresh allocated-file inode.
    pub fn allocate_i_node(&mut self) -> Result<INode, FsError> {
        let mut sup = self.read_superblock()?;
        if sup.ninode == 0 {
            let icount = sup.isize as u32 * (BLOCK_SIZE / INODE_SIZE) as u32;
            for i in 1..=icount {
                if sup.ninode as usize >= 100 {
                    break;
                }
                let node = self.read_i_node(i as u16)?;
                if !node.is_allocated() {
                    sup.inode[sup.ninode as usize] = i as u16;
                    sup.ninode += 1;
                }
            }
        }
        if sup.ninode > 0 {
            sup.ninode -= 1;
            let inum = sup.inode[sup.ninode as usize];
            self.write_superblock(&sup)?;
            let mut node = INode::new_file();
            node.inum = inum;
            Ok(node)
        } else {
            Err(FsError::NoFreeInodes)
        }
    }

    pub fn free_i_node(&mut self, inum: u16) -> Result<(), FsError> {
        let mut sup = self.read_superblock()?;
        if sup.ninode < 100 {
            sup.inode[sup.ninode as usize] = inum;
            sup.ninode += 1;
            self.write_superblock(&sup)?;
        }
        // whether the inode is really free lives in the inode itself
        let mut node = self.read_i_node(inum)?;
        node.set_free();
        self.write_i_node(&node)
    }

    /// Replace a file's contents wholesale: free what it held, then lay it
    /// out small (direct blocks) or large (8 indirect blocks).
    pub fn overwrite_file(&mut self, fnode: &mut INode, contents: &[u8]) -> Result<(), FsError> {
        if contents.len() > BIGGEST_NOT_HUGE_SIZE {
            return Err(FsError::HugeFile);
        }
        if fnode.size > 0 {
            for blkn in self.node_blocks(fnode, true)? {
                self.free_block(blkn)?;
            }
        }
        fnode.size = contents.len() as u32;
        fnode.addr = [0; 8];

        if contents.is_empty() {
            fnode.clear_large();
        } else if contents.len() <= BLOCK_SIZE * 8 {
            fnode.clear_large();
            let last = (contents.len() - 1) / BLOCK_SIZE;
            for i in 0..=last {
                let blkn = self.allocate_block()?;
                fnode.addr[i] = blkn;
                let end = contents.len().min((i + 1) * BLOCK_SIZE);
                self.write_block(blkn as u32, &contents[i * BLOCK_SIZE..end])?;
            }
        } else {
            fnode.set_large();
            let last = (contents.len() - 1) / BLOCK_SIZE;
            let mut blkcnt = 0;
            'slots: for a in 0..8 {
                let ablkn = self.allocate_block()?;
                fnode.addr[a] = ablkn;
                let mut ablkdata = Vec::with_capacity(BLOCK_SIZE);
                for _ in 0..BLOCK_SIZE / 2 {
                    let blkn = self.allocate_block()?;
                    ablkdata.extend_from_slice(&blkn.to_le_bytes());
                    let end = contents.len().min((blkcnt + 1) * BLOCK_SIZE);
                    self.write_block(blkn as u32, &contents[blkcnt * BLOCK_SIZE..end])?;
                    if blkcnt == last {
                        self.write_block(ablkn as u32, &ablkdata)?;
                        break 'slots;
                    }
                    blkcnt += 1;
                }
                self.write_block(ablkn as u32, &ablkdata)?;
            }
        }
        self.write_i_node(fnode)
    }

    /// Append a 16-byte record to a directory, allocating a fresh block at
    /// each 512-byte boundary. Directories must stay small.
    pub fn add_to_directory(&mut self, dnode: &mut INode, child: u16, name: &str) -> Result<(), FsError> {
        if dnode.is_large() || dnode.size as usize + 16 >= BLOCK_SIZE * 8 {
            return Err(FsError::DirectoryFull);
        }
        let i = dnode.size as usize / BLOCK_SIZE;
        if dnode.size as usize % BLOCK_SIZE == 0 {
            dnode.addr[i] = self.allocate_block()?;
        }
        let blksz = dnode.size as usize - BLOCK_SIZE * i;
        let mut block = self.read_block(dnode.addr[i] as u32)?;
        block.truncate(blksz);
        block.extend_from_slice(&child.to_le_bytes());
        let name = name.as_bytes();
        let n = name.len().min(14);
        block.extend_from_slice(&name[..n]);
        block.resize(blksz + 16, 0);
        self.write_block(dnode.addr[i] as u32, &block)?;
        dnode.size += 16;
        self.write_i_node(dnode)
    }

    pub fn mkdir(&mut self, dst: &str) -> Result<(), FsError> {
        if self.path_i_node(dst)?.is_some() {
            return Err(FsError::Exists(dst.to_string()));
        }
        let (dirpath, name) = split_path(dst);
        let mut pnode = self
            .path_i_node(dirpath)?
            .ok_or_else(|| FsError::NotFound(format!("destination parent {}", dirpath)))?;

        let mut node = self.allocate_i_node()?;
        let block = self.allocate_block()?;

        let mut data = Vec::with_capacity(32);
        data.extend_from_slice(&node.inum.to_le_bytes());
        data.extend_from_slice(b".");
        data.resize(16, 0);
        data.extend_from_slice(&pnode.inum.to_le_bytes());
        data.extend_from_slice(b"..");
        data.resize(32, 0);
        self.write_block(block as u32, &data)?;

        node.set_directory();
        node.addr[0] = block;
        node.size = 32;
        self.write_i_node(&node)?;

        self.add_to_directory(&mut pnode, node.inum, name)
    }

    pub fn download_file(&self, node: &INode, dst: &Path) -> Result<(), FsError> {
        fs::write(dst, self.read_file(node)?)?;
        Ok(())
    }

    fn create_file(&mut self, contents: &[u8]) -> Result<INode, FsError> {
        let mut fnode = self.allocate_i_node()?;
        match self.overwrite_file(&mut fnode, contents) {
            Ok(()) => Ok(fnode),
            Err(e) => {
                self.free_i_node(fnode.inum)?;
                Err(e)
            }
        }
    }

    /// Put a host file into the filesystem: overwrite an existing file, or
    /// create one and link it into its directory.
    pub fn upload_file(&mut self, src: &Path, dst: &str) -> Result<INode, FsError> {
        let mut fnode = self.path_i_node(dst)?;
        let mut pnode = None;
        let mut dstname = None;
        if let Some(n) = &fnode {
            if n.is_dir() {
                let base = src
                    .file_name()
                    .ok_or_else(|| FsError::NotFound(format!("{}", src.display())))?
                    .to_string_lossy()
                    .into_owned();
                let full = format!("{}/{}", dst.trim_end_matches('/'), base);
                pnode = fnode.take();
                dstname = Some(base);
                fnode = self.path_i_node(&full)?;
            }
        }
        let dstname = dstname.unwrap_or_else(|| split_path(dst).1.to_string());
        let pnode = match pnode {
            Some(p) => p,
            None => {
                let dirpath = split_path(dst).0;
                let p = self
                    .path_i_node(dirpath)?
                    .ok_or_else(|| FsError::NotFound(format!("destination directory {}", dirpath)))?;
                if !p.is_dir() {
                    return Err(FsError::NotADirectory(dirpath.to_string()));
                }
                p
            }
        };
        let contents = fs::read(src)?;
        match fnode {
            None => {
                let fnode = self.create_file(&contents)?;
                let mut pnode = pnode;
                self.add_to_directory(&mut pnode, fnode.inum, &dstname)?;
                Ok(fnode)
            }
            Some(mut fnode) => {
                self.overwrite_file(&mut fnode, &contents)?;
                Ok(fnode)
            }
        }
    }

    /// Recursive listing, optionally extracting regular files and
    /// subdirectories under `save_path`. Returns total bytes and blocks.
    pub fn tree(
        &self,
        inum: u16,
        save_path: Option<&Path>,
        depth: usize,
        out: &mut Vec<TreeEntry>,
    ) -> Result<(u64, u64), FsError> {
        let dir_node = self.read_i_node(inum)?;
        let mut data = self.list_dir(&dir_node)?;
        data.sort_by(|a, b| a.1.cmp(&b.1));
        let mut last: (u16, String) = (0, String::new());
        let (mut size, mut blk_size) = (0u64, 0u64);
        for (ino, name) in data {
            if last.0 == ino && last.1 == name {
                continue;
            }
            let node = self.read_i_node(ino)?;
            let contents = self.read_file(&node)?;
            if !node.is_dir() {
                if let Some(dir) = save_path {
                    fs::write(dir.join(&name), &contents)?;
                }
            }
            out.push(TreeEntry {
                depth,
                name: name.clone(),
                is_dir: node.is_dir(),
                size: node.size,
                flags: node.flags_string(),
                sum: sum_file(&contents),
                nlinks: node.nlinks,
                modtime: node.modtime,
            });
            size += node.size as u64;
            blk_size += (node.size as u64 / 512) + if node.size % 512 != 0 { 1 } else { 0 };
            if name != "." && name != ".." && node.is_dir() {
                let (sz, bsz) = match save_path {
                    None => self.tree(ino, None, depth + 4, out)?,
                    Some(dir) => {
                        let sub = dir.join(&name);
                        fs::create_dir(&sub)?;
                        self.tree(ino, Some(&sub), depth + 4, out)?
                    }
                };
                size += sz;
                blk_size += bsz;
            }
            last = (ino, name);
        }
        Ok((size, blk_size))
    }

    /// Extract a guest directory into a fresh host directory.
    pub fn extract_dir(
        &self,
        dst: &Path,
        src: &str,
    ) -> Result<(Vec<TreeEntry>, u64, u64), FsError> {
        if dst.exists() {
            return Err(FsError::Exists(format!("{}", dst.display())));
        }
        let node = self
            .path_i_node(src)?
            .ok_or_else(|| FsError::NotFound(src.to_string()))?;
        fs::create_dir(dst)?;
        let mut out = Vec::new();
        let (size, blocks) = self.tree(node.inum, Some(dst), 0, &mut out)?;
        Ok((out, size, blocks))
    }

    /// Audit walk of the free chain: the cached entries plus every group
    /// reachable through the chain blocks.
    pub fn get_free_blocks(&self) -> Result<Vec<u16>, FsError> {
        let sup = self.read_superblock()?;
        let mut free_blks = Vec::new();
        for &blkn in &sup.free[..sup.nfree as usize] {
            if blkn != 0 {
                free_blks.push(blkn);
            } else {
                warn!("zero block in the superblock free cache");
            }
        }
        let mut next_block = sup.free[0];
        while next_block != 0 {
            let blk = self.read_block(next_block as u32)?;
            let fr = u16le(&blk, 0);
            if fr == 0 {
                warn!("free chain block {} holds no entries", next_block);
                break;
            }
            next_block = u16le(&blk, 2);
            for i in 0..fr as usize {
                let blkn = u16le(&blk, 2 + i * 2);
                if blkn != 0 {
                    free_blks.push(blkn);
                }
            }
        }
        let unique: HashSet<u16> = free_blks.iter().copied().collect();
        if unique.len() != free_blks.len() {
            warn!("free blocks are repeated: {} / {}", unique.len(), free_blks.len());
        }
        Ok(free_blks)
    }

    pub fn count_free_blocks(&self) -> Result<usize, FsError> {
        Ok(self.get_free_blocks()?.len())
    }
}

/// Split into (dirname, basename), treating a bare name as rooted.
pub fn split_path(path: &str) -> (&str, &str) {
    let p = path.trim_end_matches('/');
    match p.rfind('/') {
        Some(i) => (&p[..i.max(1)], &p[i + 1..]),
        None => ("", p),
    }
}

/// A miniature formatted filesystem for tests: a root directory and a free
/// chain built the way mkfs builds one, by freeing every data block.
#[cfg(test)]
pub fn test_image() -> V6FileSystem {
    let isize: u16 = 4; // 64 inodes
    let fsize: u16 = 600;
    let disk = vec![0u8; fsize as usize * BLOCK_SIZE];
    let mut fs = V6FileSystem::new(disk);
    let sup = Superblock {
        isize,
        fsize,
        nfree: 1,
        free: [0; 100],
        ninode: 0,
        inode: [0; 100],
        flock: 0,
        ilock: 0,
        fmod: 0,
        time: 0,
    };
    fs.write_superblock(&sup).unwrap();
    for b in (2 + isize)..fsize {
        fs.free_block(b).unwrap();
    }
    let blk = fs.allocate_block().unwrap();
    let mut root = INode {
        inum: 1,
        flag: 0x8000 | 0x4000 | 0x01FF,
        nlinks: 2,
        uid: 0,
        gid: 0,
        size: 32,
        addr: [0; 8],
        actime: 0,
        modtime: 0,
    };
    root.addr[0] = blk;
    let mut data = Vec::new();
    data.extend_from_slice(&1u16.to_le_bytes());
    data.extend_from_slice(b".");
    data.resize(16, 0);
    data.extend_from_slice(&1u16.to_le_bytes());
    data.extend_from_slice(b"..");
    data.resize(32, 0);
    fs.write_block(blk as u32, &data).unwrap();
    fs.write_i_node(&root).unwrap();
    fs
}
