//! 帧描述
//!
//! 每个协议通过 [`FrameDescriptor`] 描述如何从字节流中识别一条完整报文：
//! - 固定长度帧头 + 由帧头计算的剩余内容长度
//! - 或以 1~2 个分隔符结尾的一行（ASCII 协议），其后可跟固定字节数
//!
//! 帧头长度沿用带符号编码：非负数为固定帧头长度；负数为分隔符哨兵值，
//! 见 [`FrameShape::from_head_length`]。

/// 行结束分隔符（1 或 2 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiter {
    bytes: [u8; 2],
    len: u8,
}

impl Delimiter {
    pub const CR_LF: Delimiter = Delimiter::pair(b'\r', b'\n');

    pub const fn single(byte: u8) -> Self {
        Self {
            bytes: [byte, 0],
            len: 1,
        }
    }

    pub const fn pair(first: u8, second: u8) -> Self {
        Self {
            bytes: [first, second],
            len: 2,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// 帧形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameShape {
    /// 固定长度帧头
    Fixed { head_len: usize },
    /// 分隔符结尾的一行，分隔符之后还有 `trailing` 个固定字节
    Delimited { delimiter: Delimiter, trailing: usize },
}

/// 分隔符哨兵中尾随字节数的上限（7 位）
pub const MAX_TRAILING: usize = 0x7F;

impl FrameShape {
    pub fn fixed(head_len: usize) -> Self {
        Self::Fixed { head_len }
    }

    pub fn line(delimiter: Delimiter) -> Self {
        Self::Delimited {
            delimiter,
            trailing: 0,
        }
    }

    /// 解析带符号帧头长度。
    ///
    /// 负数哨兵布局：bit31 置位，bit24..30 尾随字节数，bit16..23 第一个分隔符，
    /// bit8..15 第二个分隔符，bit0..7 分隔符个数（只能为 1 或 2）。
    ///
    /// # Panics
    ///
    /// 分隔符个数不是 1 或 2 时 panic（描述符定义错误）。
    pub fn from_head_length(value: i32) -> Self {
        if value >= 0 {
            return Self::Fixed {
                head_len: value as usize,
            };
        }
        let code = value as u32;
        let trailing = ((code >> 24) & 0x7F) as usize;
        let first = ((code >> 16) & 0xFF) as u8;
        let second = ((code >> 8) & 0xFF) as u8;
        let delimiter = match code & 0xFF {
            1 => Delimiter::single(first),
            2 => Delimiter::pair(first, second),
            count => panic!(
                "invalid delimiter count {count} in frame head sentinel 0x{code:08X}"
            ),
        };
        Self::Delimited {
            delimiter,
            trailing,
        }
    }

    /// 编码为带符号帧头长度（[`Self::from_head_length`] 的逆运算）
    ///
    /// # Panics
    ///
    /// 尾随字节数超过 [`MAX_TRAILING`] 时 panic。
    pub fn head_length(&self) -> i32 {
        match self {
            Self::Fixed { head_len } => i32::try_from(*head_len).unwrap_or(i32::MAX),
            Self::Delimited {
                delimiter,
                trailing,
            } => {
                assert!(
                    *trailing <= MAX_TRAILING,
                    "trailing byte count {trailing} exceeds {MAX_TRAILING}"
                );
                let code = 0x8000_0000u32
                    | ((*trailing as u32) << 24)
                    | (u32::from(delimiter.bytes[0]) << 16)
                    | (u32::from(delimiter.bytes[1]) << 8)
                    | u32::from(delimiter.len);
                code as i32
            }
        }
    }
}

/// 单条报文的识别规则。
///
/// 每条逻辑报文新建一个实例（可携带所描述的请求字节，用于校验响应帧头）。
pub trait FrameDescriptor: Send + Sync {
    /// 帧形状
    fn shape(&self) -> FrameShape;

    /// 由帧头计算剩余内容长度；0 表示帧头即整帧
    fn content_length(&self, _head: &[u8]) -> usize {
        0
    }

    /// 帧头前部的无效字节数；>= 帧头长度表示整个帧头都是垃圾数据
    fn useless_prefix_len(&self, _head: &[u8]) -> usize {
        0
    }

    /// 校验响应帧头是否与请求匹配（会话句柄、事务号等）
    fn check_head(&self, _head: &[u8]) -> bool {
        true
    }
}

/// 定长整帧
#[derive(Debug, Clone, Copy)]
pub struct FixedFrame {
    pub len: usize,
}

impl FrameDescriptor for FixedFrame {
    fn shape(&self) -> FrameShape {
        FrameShape::fixed(self.len)
    }
}

/// 分隔符结尾的一行
#[derive(Debug, Clone, Copy)]
pub struct LineFrame {
    pub delimiter: Delimiter,
    pub trailing: usize,
}

impl LineFrame {
    pub fn new(delimiter: Delimiter) -> Self {
        Self {
            delimiter,
            trailing: 0,
        }
    }
}

impl FrameDescriptor for LineFrame {
    fn shape(&self) -> FrameShape {
        FrameShape::Delimited {
            delimiter: self.delimiter,
            trailing: self.trailing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_negative_head_length_is_fixed() {
        assert_eq!(FrameShape::from_head_length(24), FrameShape::fixed(24));
        assert_eq!(FrameShape::fixed(8).head_length(), 8);
    }

    #[test]
    fn sentinel_carries_delimiters_and_trailing() {
        let shape = FrameShape::Delimited {
            delimiter: Delimiter::CR_LF,
            trailing: 2,
        };
        let sentinel = shape.head_length();
        assert!(sentinel < 0);
        assert_eq!(sentinel as u32, 0x820D_0A02);
        assert_eq!(FrameShape::from_head_length(sentinel), shape);

        let single = FrameShape::from_head_length(0x8003_0001u32 as i32);
        assert_eq!(single, FrameShape::line(Delimiter::single(0x03)));
    }

    #[test]
    #[should_panic(expected = "invalid delimiter count")]
    fn sentinel_with_bad_count_panics() {
        FrameShape::from_head_length(0x800D_0A03u32 as i32);
    }
}
