use clap::Parser;
use std::path::PathBuf;

/// 分享文件批量下载器
#[derive(Parser, Debug)]
#[command(name = "sharedl")]
#[command(version = "0.1")]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "从分享链接批量下载文件，基于 aria2 并发下载", long_about = None)]
pub struct Cli {
    /// 分享码/提取码
    #[arg(long, value_name = "CODE")]
    pub code: String,

    /// 已有的服务端会话 (可选)
    #[arg(long, value_name = "SESSION")]
    pub session: Option<String>,

    /// 分享内要下载的目录
    #[arg(long, value_name = "PATH")]
    #[arg(default_value = "/")]
    pub path: String,

    /// 只下载文件名包含该关键字的文件，可以重复指定
    #[arg(long, value_name = "NAME")]
    pub pick: Vec<String>,

    /// 文件保存目录 (会写入配置)
    #[arg(long, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,

    /// 同时下载的文件数 (1-3，会写入配置)
    #[arg(long, value_name = "N")]
    #[arg(value_parser = clap::value_parser!(u8).range(1..=3))]
    pub concurrency: Option<u8>,

    /// 配置目录
    #[arg(long, value_name = "DIR")]
    #[arg(default_value = "data")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub config: PathBuf,

    /// 输出调试日志
    #[arg(short, long)]
    pub verbose: bool,

    /// 只输出警告和错误
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Cli {
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::WARN
        } else {
            tracing::Level::INFO
        }
    }

    /// 文件名是否被 --pick 选中，未指定时全部选中
    pub fn is_picked(&self, name: &str) -> bool {
        self.pick.is_empty() || self.pick.iter().any(|p| name.contains(p.as_str()))
    }
}
