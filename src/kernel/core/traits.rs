// src/kernel/core/traits.rs
//! 外部コラボレータの trait 定義
//!
//! 仮想メモリコアの対象外サブシステム（ページテーブルハードウェア、
//! ファイルシステム、ブロックデバイス、物理ページアロケータ）は
//! すべてこのインターフェース越しにのみ利用します。
//! 組み込み先カーネル（またはテスト）が実装を提供します。

use crate::kernel::mm::types::{FileOfs, InodeId, KernPage, SectorIndex, UserPage};

/// ハードウェアページディレクトリ（プロセス毎）
///
/// メソッドは `&self` を取ります。実装はハードウェアの PTE 書き換えと
/// 同様に、個々の操作を内部で直列化してください。
pub trait PageDirectory {
    /// `page` から `frame` への変換を登録
    ///
    /// `page` が既にマップ済み、または内部の割り当てに失敗した場合は
    /// `false` を返します。
    fn install(&self, page: UserPage, frame: KernPage, writable: bool) -> bool;

    /// `page` の変換を削除（以後のアクセスはフォールト）
    fn clear(&self, page: UserPage);

    /// `page` の現在の変換先を取得
    fn lookup(&self, page: UserPage) -> Option<KernPage>;

    /// `page` のアクセスビットを取得
    fn is_accessed(&self, page: UserPage) -> bool;

    /// `page` のアクセスビットを設定
    fn set_accessed(&self, page: UserPage, accessed: bool);

    /// `page` のダーティビットを取得
    fn is_dirty(&self, page: UserPage) -> bool;
}

/// オープン済みファイルのハンドル
///
/// `Clone` は同じ inode を指す軽量ハンドルの複製です。
/// I/O は呼び出し側がファイルシステムロックを保持して行います。
pub trait FileHandle: Clone {
    /// バックにある inode の識別子
    fn inode(&self) -> InodeId;

    /// ファイル長（バイト単位）
    fn length(&self) -> u32;

    /// `ofs` から `buf.len()` バイトを読み取り、読めたバイト数を返す
    fn read_at(&self, buf: &mut [u8], ofs: FileOfs) -> usize;

    /// `ofs` へ `buf` を書き込み、書けたバイト数を返す
    fn write_at(&self, buf: &[u8], ofs: FileOfs) -> usize;

    /// 独立したハンドルを新たに開く（mmap 用）
    fn reopen(&self) -> Option<Self>
    where
        Self: Sized;

    /// このファイルへの書き込みを拒否（実行中の実行ファイル保護）
    fn deny_write(&self);

    /// [`FileHandle::deny_write`] の解除
    fn allow_write(&self);
}

/// スワップ用ブロックデバイス
///
/// セクタ単位の読み書き。実装は内部で直列化してください。
pub trait BlockDevice {
    /// デバイスの総セクタ数
    fn sector_count(&self) -> usize;

    /// 1 セクタを読み取り（`buf.len() == SECTOR_SIZE`）
    fn read_sector(&self, sector: SectorIndex, buf: &mut [u8]);

    /// 1 セクタを書き込み（`buf.len() == SECTOR_SIZE`）
    fn write_sector(&self, sector: SectorIndex, buf: &[u8]);
}

/// ユーザプールから割り当てられた 1 物理フレーム
///
/// 実カーネルではカーネル仮想アドレス経由のページ、テストではバッファ。
pub trait UserFrame {
    /// フレームの識別子（カーネルから見たページポインタ）
    fn kpage(&self) -> KernPage;

    /// フレーム内容への参照（`PAGE_SIZE` バイト）
    fn contents(&self) -> &[u8];

    /// フレーム内容への可変参照（`PAGE_SIZE` バイト）
    fn contents_mut(&mut self) -> &mut [u8];
}

/// ユーザフレームの物理ページアロケータ
pub trait FramePool {
    /// 割り当てられるフレームの型
    type Frame: UserFrame;

    /// フレームを 1 枚割り当て（`zeroed` でゼロ初期化）
    ///
    /// プールが空の場合は `None`（呼び出し側が追い出しを行う）。
    fn allocate(&self, zeroed: bool) -> Option<Self::Frame>;

    /// フレームをプールへ返却
    fn release(&self, frame: Self::Frame);
}

/// コラボレータ一式をまとめたプラットフォーム定義
pub trait Platform {
    /// ページディレクトリ実装
    type PageDirectory: PageDirectory;
    /// ファイルハンドル実装
    type File: FileHandle;
    /// スワップデバイス実装
    type Device: BlockDevice;
    /// フレーム実装
    type Frame: UserFrame;
    /// フレームプール実装
    type Pool: FramePool<Frame = Self::Frame>;
}
