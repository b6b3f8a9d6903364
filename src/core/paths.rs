//! 远端路径处理 - 名称净化与分隔符归一
//!
//! 上传与删除对账两侧必须使用同一套净化规则,否则路径无法对上

/// 远端不允许的字符,替换为视觉相近的全角字符
const CHAR_REPLACEMENTS: &[(char, char)] = &[
    ('#', '＃'),
    ('%', '％'),
    ('&', '＆'),
    ('*', '＊'),
    (':', '：'),
    ('<', '＜'),
    ('>', '＞'),
    ('?', '？'),
    ('/', '／'),
    ('\\', '＼'),
    ('|', '｜'),
    ('"', '＂'),
    ('{', '｛'),
    ('}', '｝'),
    ('~', '～'),
];

/// 历史保留名,命中后加下划线前缀
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// 名称最大长度
const MAX_NAME_LEN: usize = 255;

/// 净化单个文件/目录名,使其符合远端命名规则
pub fn sanitize_name(name: &str, is_folder: bool) -> String {
    if name.is_empty() {
        return name.to_string();
    }

    let mut sanitized: String = name
        .chars()
        .map(|c| {
            CHAR_REPLACEMENTS
                .iter()
                .find(|(from, _)| *from == c)
                .map(|(_, to)| *to)
                .unwrap_or(c)
        })
        .collect();

    // 去掉开头的 ~ $ 和已替换的全角波浪线
    while sanitized.starts_with(['~', '$', '～']) {
        sanitized.remove(0);
    }

    // 去掉结尾的句点与空格
    sanitized = sanitized.trim_end_matches(['.', ' ']).to_string();

    // 保留名检查（文件按不含扩展名的部分判断）
    let stem = if is_folder {
        sanitized.as_str()
    } else {
        sanitized.split('.').next().unwrap_or("")
    };
    if RESERVED_NAMES.contains(&stem.to_uppercase().as_str()) {
        sanitized = format!("_{}", sanitized);
    }

    if sanitized.is_empty() {
        sanitized = "_unnamed".to_string();
    }

    // 超长截断,文件名保留扩展名
    if sanitized.chars().count() > MAX_NAME_LEN {
        if !is_folder && name.contains('.') {
            let ext = name.rsplit('.').next().unwrap_or("");
            let base_len = MAX_NAME_LEN.saturating_sub(ext.chars().count() + 1);
            let base: String = sanitized.chars().take(base_len).collect();
            sanitized = format!("{}.{}", base, ext);
        } else {
            sanitized = sanitized.chars().take(MAX_NAME_LEN).collect();
        }
    }

    sanitized
}

/// 归一分隔符并逐段净化整条相对路径
pub fn sanitize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let components: Vec<&str> = normalized.split('/').filter(|c| !c.is_empty()).collect();
    let last = components.len().saturating_sub(1);

    components
        .iter()
        .enumerate()
        .map(|(i, component)| {
            // 非末段一定是目录;末段没有扩展名时也按目录规则处理
            let is_folder = i < last || !component.contains('.');
            sanitize_name(component, is_folder)
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// 取相对路径的父目录部分,根目录返回空串
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// 取相对路径的文件名部分
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_illegal_chars() {
        assert_eq!(sanitize_name("a#b%c.txt", false), "a＃b％c.txt");
        assert_eq!(sanitize_name("q?.md", false), "q？.md");
        assert_eq!(sanitize_name("pipe|name", true), "pipe｜name");
    }

    #[test]
    fn test_sanitize_leading_trailing() {
        assert_eq!(sanitize_name("~tmp.txt", false), "tmp.txt");
        assert_eq!(sanitize_name("$cache", true), "cache");
        assert_eq!(sanitize_name("name...", true), "name");
        assert_eq!(sanitize_name("name. ", true), "name");
    }

    #[test]
    fn test_sanitize_reserved() {
        assert_eq!(sanitize_name("CON.txt", false), "_CON.txt");
        assert_eq!(sanitize_name("lpt1", true), "_lpt1");
        assert_eq!(sanitize_name("console.txt", false), "console.txt");
    }

    #[test]
    fn test_sanitize_empty_result() {
        assert_eq!(sanitize_name("~~~", true), "_unnamed");
    }

    #[test]
    fn test_sanitize_long_name_keeps_extension() {
        let long = format!("{}.html", "x".repeat(300));
        let out = sanitize_name(&long, false);
        assert!(out.ends_with(".html"));
        assert!(out.chars().count() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_sanitize_path_components() {
        assert_eq!(sanitize_path("docs\\sub\\file#1.md"), "docs/sub/file＃1.md");
        assert_eq!(sanitize_path("a//b/c.txt"), "a/b/c.txt");
        // 同一路径两侧净化结果一致,删除对账依赖这一点
        assert_eq!(sanitize_path("x/~y/z.md"), sanitize_path("x\\~y\\z.md"));
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_dir("a/b/c.txt"), "a/b");
        assert_eq!(parent_dir("c.txt"), "");
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(file_name("c.txt"), "c.txt");
    }
}
