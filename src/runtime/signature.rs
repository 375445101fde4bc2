//! Method descriptors, basic types and calling-convention fingerprints.

use std::fmt;

/// Value types as the calling conventions see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
    Object,
    Array,
    Void,
}

impl BasicType {
    /// Numeric tag used in fingerprints.
    pub fn code(self) -> u8 {
        match self {
            BasicType::Boolean => 4,
            BasicType::Char => 5,
            BasicType::Float => 6,
            BasicType::Double => 7,
            BasicType::Byte => 8,
            BasicType::Short => 9,
            BasicType::Int => 10,
            BasicType::Long => 11,
            BasicType::Object => 12,
            BasicType::Array => 13,
            BasicType::Void => 14,
        }
    }

    /// Interpreter stack slots taken by one value.
    pub fn slots(self) -> usize {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void => 0,
            _ => 1,
        }
    }

    /// Collapse types that travel identically: sub-int types to int,
    /// arrays to object.
    pub fn normalized(self) -> BasicType {
        match self {
            BasicType::Boolean | BasicType::Char | BasicType::Byte | BasicType::Short => {
                BasicType::Int
            }
            BasicType::Array => BasicType::Object,
            other => other,
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }

    pub fn is_floating(self) -> bool {
        matches!(self, BasicType::Float | BasicType::Double)
    }
}

/// Error produced for malformed method descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureError {
    pub descriptor: String,
    pub position: usize,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed method descriptor {:?} at position {}",
            self.descriptor, self.position
        )
    }
}

impl std::error::Error for SignatureError {}

/// A parsed method descriptor such as `(ILjava/lang/String;[J)V`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub params: Vec<BasicType>,
    pub ret: BasicType,
}

impl MethodSignature {
    pub fn parse(descriptor: &str) -> Result<Self, SignatureError> {
        let bytes = descriptor.as_bytes();
        let error = |position| SignatureError {
            descriptor: descriptor.to_string(),
            position,
        };

        if bytes.first() != Some(&b'(') {
            return Err(error(0));
        }
        let mut pos = 1;
        let mut params = Vec::new();
        while pos < bytes.len() && bytes[pos] != b')' {
            let (ty, next) = parse_field_type(bytes, pos).ok_or_else(|| error(pos))?;
            if ty == BasicType::Void {
                return Err(error(pos));
            }
            params.push(ty);
            pos = next;
        }
        if pos >= bytes.len() {
            return Err(error(pos));
        }
        pos += 1;

        let (ret, next) = parse_field_type(bytes, pos).ok_or_else(|| error(pos))?;
        if next != bytes.len() {
            return Err(error(next));
        }
        Ok(Self { params, ret })
    }

    /// Arguments as passed, receiver first for instance methods.
    pub fn java_args(&self, is_static: bool) -> Vec<BasicType> {
        let mut args = Vec::with_capacity(self.params.len() + 1);
        if !is_static {
            args.push(BasicType::Object);
        }
        args.extend_from_slice(&self.params);
        args
    }

    /// Interpreter slots used by the arguments.
    pub fn size_of_parameters(&self, is_static: bool) -> usize {
        self.java_args(is_static).iter().map(|t| t.slots()).sum()
    }
}

fn parse_field_type(bytes: &[u8], pos: usize) -> Option<(BasicType, usize)> {
    let ty = match *bytes.get(pos)? {
        b'Z' => BasicType::Boolean,
        b'C' => BasicType::Char,
        b'F' => BasicType::Float,
        b'D' => BasicType::Double,
        b'B' => BasicType::Byte,
        b'S' => BasicType::Short,
        b'I' => BasicType::Int,
        b'J' => BasicType::Long,
        b'V' => BasicType::Void,
        b'L' => {
            let end = bytes[pos..].iter().position(|&b| b == b';')?;
            if end == 1 {
                return None;
            }
            return Some((BasicType::Object, pos + end + 1));
        }
        b'[' => {
            let mut elem = pos + 1;
            while bytes.get(elem) == Some(&b'[') {
                elem += 1;
            }
            let (inner, next) = parse_field_type(bytes, elem)?;
            if inner == BasicType::Void {
                return None;
            }
            return Some((BasicType::Array, next));
        }
        _ => return None,
    };
    Some((ty, pos + 1))
}

/// Calling-convention fingerprint: normalized argument types packed four
/// bits each. Methods with equal fingerprints share adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    words: Vec<u64>,
    len: usize,
}

const NIBBLES_PER_WORD: usize = 16;

impl Fingerprint {
    pub fn from_types(types: &[BasicType]) -> Self {
        let mut words = vec![0u64; types.len().div_ceil(NIBBLES_PER_WORD)];
        for (i, ty) in types.iter().enumerate() {
            let word = i / NIBBLES_PER_WORD;
            let shift = (i % NIBBLES_PER_WORD) * 4;
            words[word] |= (ty.normalized().code() as u64) << shift;
        }
        Self {
            words,
            len: types.len(),
        }
    }

    pub fn for_method(signature: &MethodSignature, is_static: bool) -> Self {
        Self::from_types(&signature.java_args(is_static))
    }

    /// Number of arguments covered.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.words.is_empty() {
            return write!(f, "0x0");
        }
        write!(f, "0x")?;
        for word in self.words.iter().rev() {
            write!(f, "{:016x}", word)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        let sig = MethodSignature::parse("(ILjava/lang/String;[J)V").unwrap();
        assert_eq!(
            sig.params,
            vec![BasicType::Int, BasicType::Object, BasicType::Array]
        );
        assert_eq!(sig.ret, BasicType::Void);

        let sig = MethodSignature::parse("()Z").unwrap();
        assert!(sig.params.is_empty());
        assert_eq!(sig.ret, BasicType::Boolean);

        let sig = MethodSignature::parse("([[Ljava/lang/Object;D)[I").unwrap();
        assert_eq!(sig.params, vec![BasicType::Array, BasicType::Double]);
        assert_eq!(sig.ret, BasicType::Array);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "I)V", "(I", "(I)", "(V)V", "(L;)V", "(Ljava/lang/String)V", "(I)VV", "(Q)V"] {
            assert!(MethodSignature::parse(bad).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn test_parameter_slots() {
        let sig = MethodSignature::parse("(JID)V").unwrap();
        assert_eq!(sig.size_of_parameters(true), 5);
        assert_eq!(sig.size_of_parameters(false), 6);
    }

    #[test]
    fn test_fingerprint_normalization() {
        let a = MethodSignature::parse("(ZBCS[I)V").unwrap();
        let b = MethodSignature::parse("(IIIILjava/lang/Object;)J").unwrap();
        assert_eq!(
            Fingerprint::for_method(&a, true),
            Fingerprint::for_method(&b, true)
        );
        assert_ne!(
            Fingerprint::for_method(&a, true),
            Fingerprint::for_method(&a, false)
        );
    }

    #[test]
    fn test_fingerprint_length_matters() {
        let none = Fingerprint::from_types(&[]);
        let one = Fingerprint::from_types(&[BasicType::Int]);
        let two = Fingerprint::from_types(&[BasicType::Int, BasicType::Int]);
        assert_ne!(none, one);
        assert_ne!(one, two);
        assert_eq!(one.to_string(), "0x000000000000000a");
    }

    #[test]
    fn test_fingerprint_spans_words() {
        let many = vec![BasicType::Long; 20];
        let fp = Fingerprint::from_types(&many);
        assert_eq!(fp.len(), 20);
        let mut other = many.clone();
        other[19] = BasicType::Double;
        assert_ne!(fp, Fingerprint::from_types(&other));
    }
}
