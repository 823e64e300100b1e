//! String marshalling across the module boundary
//!
//! Two guest memory disciplines exist:
//! - [`Abi::Buffer`]: the guest exports `allocate`/`deallocate` and data is
//!   passed as raw UTF-8 `(ptr, len)` pairs into caller-allocated buffers.
//! - [`Abi::Managed`]: the guest runtime owns string memory (`__new`);
//!   strings are UTF-16LE objects whose byte length sits at `ptr - 4`.
//!
//! Every read and write is bounds checked against linear memory and
//! against the capacity the caller handed out. Nothing is truncated.

use wasmtime::{AsContext, AsContextMut, Instance, Memory, TypedFunc};

use crate::{PluginError, PluginResult};

/// Buffer handed to identity exports (`plugin_id`, `plugin_schema`, ...)
pub const IDENTITY_BUFFER_BYTES: usize = 8 * 1024;

/// Response buffer handed to HTTP handler exports
pub const HTTP_RESPONSE_BUFFER_BYTES: usize = 64 * 1024;

/// Response buffer handed to PUT handler exports
pub const PUT_RESPONSE_BUFFER_BYTES: usize = 8 * 1024;

/// Runtime class ids used by the managed allocator
const MANAGED_ARRAY_BUFFER_ID: i32 = 1;
const MANAGED_STRING_ID: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    Buffer,
    Managed,
}

fn offset(ptr: i32) -> usize {
    ptr as u32 as usize
}

pub fn read_bytes(
    memory: &Memory,
    store: impl AsContext,
    ptr: i32,
    len: i32,
) -> PluginResult<Vec<u8>> {
    if len < 0 {
        return Err(PluginError::Wasm(format!("negative length {len}")));
    }
    let (start, len) = (offset(ptr), len as usize);
    let size = memory.data_size(&store);
    if start.checked_add(len).is_none_or(|end| end > size) {
        return Err(PluginError::Wasm(format!(
            "read of {len} bytes at {start} is outside linear memory ({size} bytes)"
        )));
    }
    let mut buf = vec![0u8; len];
    memory
        .read(&store, start, &mut buf)
        .map_err(|e| PluginError::wasm("out of bounds read", e))?;
    Ok(buf)
}

pub fn read_utf8(memory: &Memory, store: impl AsContext, ptr: i32, len: i32) -> PluginResult<String> {
    let bytes = read_bytes(memory, store, ptr, len)?;
    String::from_utf8(bytes).map_err(|e| PluginError::wasm("invalid UTF-8 from plugin", e))
}

/// Write `bytes` into a buffer of `capacity` bytes at `ptr`
pub fn write_bytes(
    memory: &Memory,
    mut store: impl AsContextMut,
    ptr: i32,
    capacity: usize,
    bytes: &[u8],
) -> PluginResult<usize> {
    if bytes.len() > capacity {
        return Err(PluginError::BufferTooSmall {
            needed: bytes.len(),
            capacity,
        });
    }
    memory
        .write(&mut store, offset(ptr), bytes)
        .map_err(|e| PluginError::wasm("out of bounds write", e))?;
    Ok(bytes.len())
}

/// Validate a length a guest reports having written into a host buffer
pub fn checked_len(written: i32, capacity: usize) -> PluginResult<usize> {
    if written < 0 {
        return Err(PluginError::BufferTooSmall {
            needed: capacity + 1,
            capacity,
        });
    }
    let written = written as usize;
    if written > capacity {
        return Err(PluginError::BufferTooSmall {
            needed: written,
            capacity,
        });
    }
    Ok(written)
}

pub fn encode_utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

pub fn decode_utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Read a managed string object
pub fn read_managed_string(memory: &Memory, store: impl AsContext, ptr: i32) -> PluginResult<String> {
    if ptr == 0 {
        return Ok(String::new());
    }
    if offset(ptr) < 4 {
        return Err(PluginError::Wasm(format!("invalid managed string pointer {ptr}")));
    }
    let header = read_bytes(memory, &store, ptr - 4, 4)?;
    let byte_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let byte_len = i32::try_from(byte_len)
        .map_err(|_| PluginError::Wasm(format!("managed string too long: {byte_len}")))?;
    let bytes = read_bytes(memory, &store, ptr, byte_len)?;
    Ok(decode_utf16(&bytes))
}

/// A guest allocation that must be released after the call it was made for
#[derive(Debug, Clone, Copy)]
pub struct GuestAlloc {
    pub ptr: i32,
    pub len: i32,
}

/// Exported memory plus the allocator functions of one instance,
/// resolved once at load time.
#[derive(Clone)]
pub struct GuestMemory {
    abi: Abi,
    memory: Memory,
    allocate: Option<TypedFunc<i32, i32>>,
    deallocate: Option<TypedFunc<(i32, i32), ()>>,
    new: Option<TypedFunc<(i32, i32), i32>>,
    pin: Option<TypedFunc<i32, i32>>,
    unpin: Option<TypedFunc<i32, ()>>,
}

impl GuestMemory {
    pub fn resolve(mut store: impl AsContextMut, instance: &Instance) -> PluginResult<Self> {
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| PluginError::ExportMissing("memory".to_string()))?;

        let has_allocate = instance.get_export(&mut store, "allocate").is_some();
        let has_new = instance.get_export(&mut store, "__new").is_some();

        let abi = if has_allocate {
            Abi::Buffer
        } else if has_new {
            Abi::Managed
        } else {
            return Err(PluginError::ExportMissing("allocate".to_string()));
        };

        let mut guest = Self {
            abi,
            memory,
            allocate: None,
            deallocate: None,
            new: None,
            pin: None,
            unpin: None,
        };

        match abi {
            Abi::Buffer => {
                guest.allocate = Some(
                    instance
                        .get_typed_func::<i32, i32>(&mut store, "allocate")
                        .map_err(|e| PluginError::wasm("allocate", e))?,
                );
                guest.deallocate = instance
                    .get_typed_func::<(i32, i32), ()>(&mut store, "deallocate")
                    .ok();
            }
            Abi::Managed => {
                guest.new = Some(
                    instance
                        .get_typed_func::<(i32, i32), i32>(&mut store, "__new")
                        .map_err(|e| PluginError::wasm("__new", e))?,
                );
                guest.pin = instance.get_typed_func::<i32, i32>(&mut store, "__pin").ok();
                guest.unpin = instance.get_typed_func::<i32, ()>(&mut store, "__unpin").ok();
            }
        }

        Ok(guest)
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Allocate `len` bytes in the guest
    pub fn alloc(&self, mut store: impl AsContextMut, len: usize) -> PluginResult<GuestAlloc> {
        let len = i32::try_from(len)
            .map_err(|_| PluginError::Wasm(format!("allocation too large: {len}")))?;
        let ptr = match (self.abi, &self.allocate, &self.new) {
            (Abi::Buffer, Some(allocate), _) => allocate
                .call(&mut store, len)
                .map_err(|e| PluginError::wasm("allocate", e))?,
            (Abi::Managed, _, Some(new)) => {
                let ptr = new
                    .call(&mut store, (len, MANAGED_ARRAY_BUFFER_ID))
                    .map_err(|e| PluginError::wasm("__new", e))?;
                self.pin_ptr(&mut store, ptr)?
            }
            _ => return Err(PluginError::ExportMissing("allocate".to_string())),
        };
        if ptr == 0 && len > 0 {
            return Err(PluginError::Wasm("guest allocator returned null".to_string()));
        }
        Ok(GuestAlloc { ptr, len })
    }

    /// Release an allocation; failures are ignored since the call already happened
    pub fn free(&self, mut store: impl AsContextMut, alloc: GuestAlloc) {
        let result = match self.abi {
            Abi::Buffer => match &self.deallocate {
                Some(deallocate) => deallocate.call(&mut store, (alloc.ptr, alloc.len)),
                None => Ok(()),
            },
            Abi::Managed => match &self.unpin {
                Some(unpin) => unpin.call(&mut store, alloc.ptr),
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "guest free failed");
        }
    }

    fn pin_ptr(&self, mut store: impl AsContextMut, ptr: i32) -> PluginResult<i32> {
        match &self.pin {
            Some(pin) => pin
                .call(&mut store, ptr)
                .map_err(|e| PluginError::wasm("__pin", e)),
            None => Ok(ptr),
        }
    }

    /// Copy raw bytes into a fresh guest allocation
    pub fn pass_bytes(&self, mut store: impl AsContextMut, bytes: &[u8]) -> PluginResult<GuestAlloc> {
        let alloc = self.alloc(&mut store, bytes.len())?;
        if let Err(e) = write_bytes(&self.memory, &mut store, alloc.ptr, bytes.len(), bytes) {
            self.free(&mut store, alloc);
            return Err(e);
        }
        Ok(alloc)
    }

    /// Create a managed string object holding `text`
    pub fn new_managed_string(&self, mut store: impl AsContextMut, text: &str) -> PluginResult<GuestAlloc> {
        let new = self
            .new
            .as_ref()
            .ok_or_else(|| PluginError::ExportMissing("__new".to_string()))?;
        let bytes = encode_utf16(text);
        let len = i32::try_from(bytes.len())
            .map_err(|_| PluginError::Wasm("string too large".to_string()))?;
        let ptr = new
            .call(&mut store, (len, MANAGED_STRING_ID))
            .map_err(|e| PluginError::wasm("__new", e))?;
        let ptr = self.pin_ptr(&mut store, ptr)?;
        let alloc = GuestAlloc { ptr, len };
        if let Err(e) = write_bytes(&self.memory, &mut store, ptr, bytes.len(), &bytes) {
            self.free(&mut store, alloc);
            return Err(e);
        }
        Ok(alloc)
    }

    pub fn read_utf8(&self, store: impl AsContext, ptr: i32, len: usize) -> PluginResult<String> {
        let len = i32::try_from(len).map_err(|_| PluginError::Wasm("length overflow".to_string()))?;
        read_utf8(&self.memory, store, ptr, len)
    }

    pub fn read_managed(&self, store: impl AsContext, ptr: i32) -> PluginResult<String> {
        read_managed_string(&self.memory, store, ptr)
    }
}
