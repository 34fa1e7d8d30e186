use super::Backend;

/// Image source backed by an owned buffer
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Take ownership of `data`
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Image source backed by bytes compiled into the binary, e.g. via `include_bytes!`
#[derive(Debug, Clone, Copy)]
pub struct Embedded {
    data: &'static [u8],
}

impl Embedded {
    /// Wrap static image bytes
    pub fn new(data: &'static [u8]) -> Embedded {
        Embedded { data }
    }
}

impl Backend for Embedded {
    fn data(&self) -> &[u8] {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error::OutOfBounds;

    static BLOB: [u8; 6] = [b'M', b'Z', 0x90, 0x00, 0x03, 0x00];

    #[test]
    fn memory() {
        let mut data = vec![0xCC_u8; 1048];
        data[10..15].copy_from_slice(&[0xBB; 5]);

        let memory = Memory::new(data);

        assert_eq!(memory.len(), 1048);
        assert_eq!(memory.data()[42], 0xCC);
        assert_eq!(memory.data_slice(10, 5).unwrap(), &[0xBB; 5]);
        assert!(memory.data_slice(0, 2048).is_err());
    }

    #[test]
    fn range_edges() {
        let memory = Memory::new(vec![0x00; 100]);

        assert!(matches!(memory.data_slice(usize::MAX, 1), Err(OutOfBounds)));
        assert!(matches!(memory.data_slice(99, 2), Err(OutOfBounds)));
        assert!(memory.data_slice(100, 0).unwrap().is_empty());
    }

    #[test]
    fn embedded() {
        let embedded = Embedded::new(&BLOB);

        assert_eq!(embedded.len(), 6);
        assert_eq!(embedded.data_slice(0, 2).unwrap(), b"MZ");
        assert!(embedded.data_slice(5, 2).is_err());
    }
}
