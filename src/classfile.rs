//! Minimal JVM class file reader.
//!
//! Only what the instrumentation coordinator needs is extracted: the class name, the
//! super class and the name, descriptor and access flags of every declared method.
//! Attributes are skipped unparsed and nothing is verified beyond structural bounds.
//!
//! ## Layout
//!
//! 1. **Header**: magic `0xCAFEBABE`, minor and major version
//! 2. **Constant pool**: `count - 1` tagged entries (`Long`/`Double` take two slots)
//! 3. **Class info**: access flags, this class, super class, interfaces
//! 4. **Fields** and **Methods**: flags, name index, descriptor index, attributes

use tracing::trace;

use crate::error::DecodeError;
use crate::wire::format::WireReader;

pub const CLASS_MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_ABSTRACT: u16 = 0x0400;

// Constant pool tags
const CONSTANT_UTF8: u8 = 1;
const CONSTANT_INTEGER: u8 = 3;
const CONSTANT_FLOAT: u8 = 4;
const CONSTANT_LONG: u8 = 5;
const CONSTANT_DOUBLE: u8 = 6;
const CONSTANT_CLASS: u8 = 7;
const CONSTANT_STRING: u8 = 8;
const CONSTANT_FIELDREF: u8 = 9;
const CONSTANT_METHODREF: u8 = 10;
const CONSTANT_INTERFACE_METHODREF: u8 = 11;
const CONSTANT_NAME_AND_TYPE: u8 = 12;
const CONSTANT_METHOD_HANDLE: u8 = 15;
const CONSTANT_METHOD_TYPE: u8 = 16;
const CONSTANT_DYNAMIC: u8 = 17;
const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
const CONSTANT_MODULE: u8 = 19;
const CONSTANT_PACKAGE: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolEntry {
    Utf8(String),
    Class { name_index: u16 },
    Other,
    /// Second slot of a `Long` or `Double`
    Unusable,
}

/// A method declared by a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
}

impl MethodInfo {
    /// Abstract and native methods have no bytecode to instrument.
    pub fn has_code(&self) -> bool {
        self.access_flags & (ACC_ABSTRACT | ACC_NATIVE) == 0
    }
}

/// The parts of a class file the profiler cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFile {
    pub major_version: u16,
    /// Dotted name, e.g. `com.example.Service$Inner`
    pub class_name: String,
    pub super_name: Option<String>,
    pub methods: Vec<MethodInfo>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(bytes);

        let magic = r.read_u32()?;
        if magic != CLASS_MAGIC {
            return Err(DecodeError::malformed("class file", format!("bad magic {magic:#010x}")));
        }
        let _minor = r.read_u16()?;
        let major_version = r.read_u16()?;

        let pool = read_constant_pool(&mut r)?;

        let _access = r.read_u16()?;
        let this_class = r.read_u16()?;
        let super_class = r.read_u16()?;
        let class_name = class_name_at(&pool, this_class)?;
        let super_name =
            if super_class == 0 { None } else { Some(class_name_at(&pool, super_class)?) };

        let interfaces = r.read_u16()? as usize;
        r.skip(interfaces * 2)?;

        let fields = r.read_u16()?;
        for _ in 0..fields {
            r.skip(6)?;
            skip_attributes(&mut r)?;
        }

        let method_count = r.read_u16()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            let access_flags = r.read_u16()?;
            let name = utf8_at(&pool, r.read_u16()?)?.to_string();
            let descriptor = utf8_at(&pool, r.read_u16()?)?.to_string();
            skip_attributes(&mut r)?;
            methods.push(MethodInfo { access_flags, name, descriptor });
        }
        skip_attributes(&mut r)?;

        trace!(
            "Parsed class {} (major {}, {} methods, {} pool entries)",
            class_name,
            major_version,
            methods.len(),
            pool.len()
        );

        Ok(Self { major_version, class_name, super_name, methods })
    }
}

fn read_constant_pool(r: &mut WireReader<'_>) -> Result<Vec<PoolEntry>, DecodeError> {
    let count = r.read_u16()? as usize;
    if count == 0 {
        return Err(DecodeError::malformed("class file", "constant pool count is zero"));
    }

    // Index 0 is unused by the format.
    let mut pool = Vec::with_capacity(count);
    pool.push(PoolEntry::Unusable);

    while pool.len() < count {
        let tag = r.read_u8()?;
        let entry = match tag {
            CONSTANT_UTF8 => {
                let len = r.read_u16()? as usize;
                // Modified UTF-8 differs from UTF-8 only for NUL and supplementary characters.
                PoolEntry::Utf8(String::from_utf8_lossy(r.take(len)?).into_owned())
            }
            CONSTANT_CLASS => PoolEntry::Class { name_index: r.read_u16()? },
            CONSTANT_INTEGER | CONSTANT_FLOAT => {
                r.skip(4)?;
                PoolEntry::Other
            }
            CONSTANT_LONG | CONSTANT_DOUBLE => {
                r.skip(8)?;
                pool.push(PoolEntry::Other);
                PoolEntry::Unusable
            }
            CONSTANT_STRING | CONSTANT_METHOD_TYPE | CONSTANT_MODULE | CONSTANT_PACKAGE => {
                r.skip(2)?;
                PoolEntry::Other
            }
            CONSTANT_FIELDREF
            | CONSTANT_METHODREF
            | CONSTANT_INTERFACE_METHODREF
            | CONSTANT_NAME_AND_TYPE
            | CONSTANT_DYNAMIC
            | CONSTANT_INVOKE_DYNAMIC => {
                r.skip(4)?;
                PoolEntry::Other
            }
            CONSTANT_METHOD_HANDLE => {
                r.skip(3)?;
                PoolEntry::Other
            }
            other => {
                return Err(DecodeError::malformed(
                    "class file",
                    format!("unknown constant pool tag {other} at index {}", pool.len()),
                ));
            }
        };
        pool.push(entry);
    }

    if pool.len() > count {
        return Err(DecodeError::malformed("class file", "wide constant overruns the pool"));
    }
    Ok(pool)
}

fn skip_attributes(r: &mut WireReader<'_>) -> Result<(), DecodeError> {
    let count = r.read_u16()?;
    for _ in 0..count {
        r.skip(2)?;
        let len = r.read_u32()? as usize;
        r.skip(len)?;
    }
    Ok(())
}

fn utf8_at(pool: &[PoolEntry], index: u16) -> Result<&str, DecodeError> {
    match pool.get(index as usize) {
        Some(PoolEntry::Utf8(value)) => Ok(value),
        _ => Err(DecodeError::malformed("class file", format!("index {index} is not a Utf8 constant"))),
    }
}

fn class_name_at(pool: &[PoolEntry], index: u16) -> Result<String, DecodeError> {
    match pool.get(index as usize) {
        Some(PoolEntry::Class { name_index }) => Ok(utf8_at(pool, *name_index)?.replace('/', ".")),
        _ => Err(DecodeError::malformed("class file", format!("index {index} is not a Class constant"))),
    }
}
